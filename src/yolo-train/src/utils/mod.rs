pub mod env;
pub mod metrics;
