//! Training driver for Darknet/YOLOv3 style detectors on burn.

pub mod backend;
pub mod common;
pub mod config;
pub mod data;
pub mod model;
pub mod sinks;
pub mod tui;
pub mod utils;
