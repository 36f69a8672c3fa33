//! Detector assembled from a parsed Darknet definition.
//!
//! Every definition section becomes one [`DarknetLayer`], so layer indices in
//! `[route]`/`[shortcut]` sections and in checkpoint keys match the file.

use crate::config::{ConfigError, Hyperparams, LayerDef, ModelDefinition};
use crate::model::blocks::ConvBlock;

use burn::{
    module::Ignored,
    nn::{
        PaddingConfig2d,
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
};

/// Anchors and class count of one `[yolo]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadSpec {
    /// Anchor priors in input pixels.
    pub anchors: Vec<(f32, f32)>,
    pub classes: usize,
}

impl HeadSpec {
    pub fn outputs_per_anchor(&self) -> usize {
        5 + self.classes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    Conv,
    /// Kernel 2, stride 1 pools pad one pixel right/bottom to keep the size.
    MaxPool { pad_edge: bool },
    Upsample { scale: usize },
    /// Absolute indices of the concatenated layers.
    Route { sources: Vec<usize> },
    Shortcut { source: usize },
    Yolo(HeadSpec),
}

#[derive(Module, Debug)]
pub struct DarknetLayer<B: Backend> {
    pub conv: Option<ConvBlock<B>>,
    pool: Option<MaxPool2d>,
    kind: Ignored<LayerKind>,
}

impl<B: Backend> DarknetLayer<B> {
    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }
}

/// Raw output of one detection head.
#[derive(Debug, Clone)]
pub struct HeadOutput<B: Backend> {
    /// `[N, A, H, W, 5 + C]`: `tx, ty, tw, th, objectness, classes...` logits.
    pub raw: Tensor<B, 5>,
    pub spec: HeadSpec,
    /// Input pixels per grid cell.
    pub stride: f32,
}

impl<B: Backend> HeadOutput<B> {
    pub fn grid(&self) -> (usize, usize) {
        let [_, _, h, w, _] = self.raw.dims();
        (h, w)
    }
}

#[derive(Module, Debug)]
pub struct Detector<B: Backend> {
    pub layers: Vec<DarknetLayer<B>>,
    hyperparams: Ignored<Hyperparams>,
    /// Images processed in training, carried by Darknet weight files.
    seen: Ignored<u64>,
}

fn resolve(index: usize, offset: isize, what: &str) -> Result<usize, ConfigError> {
    let target = if offset < 0 {
        index as isize + offset
    } else {
        offset
    };
    if target < 0 || target as usize >= index {
        return Err(ConfigError::Architecture(format!(
            "layer {index}: {what} refers to layer {offset}, which does not precede it"
        )));
    }
    Ok(target as usize)
}

impl<B: Backend> Detector<B> {
    /// Builds the layers, checking channel counts along the way.
    pub fn from_definition(
        definition: &ModelDefinition,
        device: &Device<B>,
    ) -> Result<Self, ConfigError> {
        let mut out_channels: Vec<usize> = Vec::with_capacity(definition.layers.len());
        let mut layers = Vec::with_capacity(definition.layers.len());
        let mut channels = definition.hyperparams.channels;

        for (index, def) in definition.layers.iter().enumerate() {
            let (layer, filters) = match def {
                LayerDef::Convolutional {
                    batch_normalize,
                    filters,
                    size,
                    stride,
                    padding,
                    activation,
                } => {
                    let conv = ConvBlock::new(
                        channels,
                        *filters,
                        *size,
                        *stride,
                        *padding,
                        *batch_normalize,
                        *activation,
                        device,
                    );
                    let layer = DarknetLayer {
                        conv: Some(conv),
                        pool: None,
                        kind: Ignored(LayerKind::Conv),
                    };
                    (layer, *filters)
                }
                LayerDef::MaxPool { size, stride } => {
                    let pad_edge = *size == 2 && *stride == 1;
                    let pool = MaxPool2dConfig::new([*size, *size])
                        .with_strides([*stride, *stride])
                        .with_padding(PaddingConfig2d::Explicit((size - 1) / 2, (size - 1) / 2))
                        .init();
                    let layer = DarknetLayer {
                        conv: None,
                        pool: Some(pool),
                        kind: Ignored(LayerKind::MaxPool { pad_edge }),
                    };
                    (layer, channels)
                }
                LayerDef::Upsample { stride } => (
                    DarknetLayer {
                        conv: None,
                        pool: None,
                        kind: Ignored(LayerKind::Upsample { scale: *stride }),
                    },
                    channels,
                ),
                LayerDef::Route { layers: offsets } => {
                    let sources = offsets
                        .iter()
                        .map(|&o| resolve(index, o, "route"))
                        .collect::<Result<Vec<_>, _>>()?;
                    let filters = sources.iter().map(|&s| out_channels[s]).sum();
                    let layer = DarknetLayer {
                        conv: None,
                        pool: None,
                        kind: Ignored(LayerKind::Route { sources }),
                    };
                    (layer, filters)
                }
                LayerDef::Shortcut { from } => {
                    let source = resolve(index, *from, "shortcut")?;
                    if out_channels[source] != channels {
                        return Err(ConfigError::Architecture(format!(
                            "layer {index}: shortcut adds {} channels to {channels}",
                            out_channels[source]
                        )));
                    }
                    let layer = DarknetLayer {
                        conv: None,
                        pool: None,
                        kind: Ignored(LayerKind::Shortcut { source }),
                    };
                    (layer, channels)
                }
                LayerDef::Yolo { anchors, classes } => {
                    let spec = HeadSpec {
                        anchors: anchors.clone(),
                        classes: *classes,
                    };
                    let expected = anchors.len() * spec.outputs_per_anchor();
                    if channels != expected {
                        return Err(ConfigError::Architecture(format!(
                            "layer {index}: yolo head with {} anchors and {classes} classes needs \
                             {expected} input channels, got {channels}",
                            anchors.len()
                        )));
                    }
                    let layer = DarknetLayer {
                        conv: None,
                        pool: None,
                        kind: Ignored(LayerKind::Yolo(spec)),
                    };
                    (layer, channels)
                }
            };
            channels = filters;
            out_channels.push(filters);
            layers.push(layer);
        }

        Ok(Self {
            layers,
            hyperparams: Ignored(definition.hyperparams.clone()),
            seen: Ignored(0),
        })
    }

    pub fn hyperparams(&self) -> &Hyperparams {
        &self.hyperparams
    }

    pub fn seen(&self) -> u64 {
        *self.seen
    }

    pub fn set_seen(&mut self, seen: u64) {
        self.seen = Ignored(seen);
    }

    pub fn add_seen(&mut self, images: usize) {
        self.seen = Ignored(*self.seen + images as u64);
    }

    pub fn heads(&self) -> impl Iterator<Item = &HeadSpec> {
        self.layers.iter().filter_map(|l| match l.kind() {
            LayerKind::Yolo(spec) => Some(spec),
            _ => None,
        })
    }

    /// Class count of the detection heads (all heads share it).
    pub fn num_classes(&self) -> usize {
        self.heads().map(|h| h.classes).max().unwrap_or(0)
    }

    pub fn num_parameters(&self) -> usize {
        self.num_params()
    }

    /// Runs the network; returns one output per `[yolo]` section, in file order.
    pub fn forward(&self, input: Tensor<B, 4>) -> Vec<HeadOutput<B>> {
        let img_size = input.dims()[3] as f32;
        let mut outputs: Vec<Tensor<B, 4>> = Vec::with_capacity(self.layers.len());
        let mut heads = Vec::new();
        let mut x = input;

        for layer in &self.layers {
            x = match layer.kind() {
                LayerKind::Conv => match &layer.conv {
                    Some(conv) => conv.forward(x),
                    None => x,
                },
                LayerKind::MaxPool { pad_edge } => {
                    let x = if *pad_edge { x.pad((0, 1, 0, 1), 0.0) } else { x };
                    match &layer.pool {
                        Some(pool) => pool.forward(x),
                        None => x,
                    }
                }
                LayerKind::Upsample { scale } => upsample_nearest(x, *scale),
                LayerKind::Route { sources } => {
                    let parts = sources.iter().map(|&s| outputs[s].clone()).collect();
                    Tensor::cat(parts, 1)
                }
                LayerKind::Shortcut { source } => x + outputs[*source].clone(),
                LayerKind::Yolo(spec) => {
                    let [n, _, h, w] = x.dims();
                    let raw = x
                        .clone()
                        .reshape([n, spec.anchors.len(), spec.outputs_per_anchor(), h, w])
                        .permute([0, 1, 3, 4, 2]);
                    heads.push(HeadOutput {
                        raw,
                        spec: spec.clone(),
                        stride: img_size / w as f32,
                    });
                    x
                }
            };
            outputs.push(x.clone());
        }
        heads
    }

    /// One line per layer, logged by `--verbose`.
    pub fn summary(&self) -> String {
        let mut lines = Vec::with_capacity(self.layers.len() + 1);
        for (i, layer) in self.layers.iter().enumerate() {
            let line = match (layer.kind(), &layer.conv) {
                (LayerKind::Conv, Some(conv)) => {
                    let [out, inp, k, _] = conv.conv.weight.dims();
                    let bn = if conv.norm.is_some() { " bn" } else { "" };
                    format!("{i:>4} conv     {inp:>5} -> {out:<5} {k}x{k}{bn}")
                }
                (LayerKind::MaxPool { .. }, _) => format!("{i:>4} maxpool"),
                (LayerKind::Upsample { scale }, _) => format!("{i:>4} upsample x{scale}"),
                (LayerKind::Route { sources }, _) => format!("{i:>4} route    {sources:?}"),
                (LayerKind::Shortcut { source }, _) => format!("{i:>4} shortcut {source}"),
                (LayerKind::Yolo(spec), _) => format!(
                    "{i:>4} yolo     {} anchors, {} classes",
                    spec.anchors.len(),
                    spec.classes
                ),
                (LayerKind::Conv, None) => format!("{i:>4} conv (empty)"),
            };
            lines.push(line);
        }
        lines.push(format!("parameters: {}", self.num_parameters()));
        lines.join("\n")
    }
}

fn upsample_nearest<B: Backend>(x: Tensor<B, 4>, scale: usize) -> Tensor<B, 4> {
    let [n, c, h, w] = x.dims();
    x.reshape([n, c, h, 1, w, 1])
        .repeat_dim(3, scale)
        .repeat_dim(5, scale)
        .reshape([n, c, h * scale, w * scale])
}
