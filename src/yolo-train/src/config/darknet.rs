//! Parser for Darknet model definition files (`.cfg`).
//!
//! A definition is a list of `[section]` headers followed by `key=value`
//! lines. The first section must be `[net]` and carries the training
//! hyperparameters; every following section describes one layer.

use super::ConfigError;
use crate::common::CHANNELS;
use std::{fmt, fs, path::Path, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "sgd" => Ok(OptimizerKind::Sgd),
            other => Err(ConfigError::UnknownOptimizer(other.to_string())),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Adam => write!(f, "adam"),
            OptimizerKind::Sgd => write!(f, "sgd"),
        }
    }
}

/// Training hyperparameters declared in the `[net]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct Hyperparams {
    pub batch: usize,
    pub subdivisions: usize,
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub optimizer: OptimizerKind,
    pub momentum: f64,
    pub decay: f64,
    pub learning_rate: f64,
    pub burn_in: usize,
    pub max_batches: usize,
    pub policy: String,
    /// `(threshold, multiplier)` pairs, in file order.
    pub lr_steps: Vec<(usize, f64)>,
}

impl Hyperparams {
    /// Images per forward pass: the declared batch split into subdivisions.
    pub fn mini_batch_size(&self) -> usize {
        (self.batch / self.subdivisions.max(1)).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Leaky,
    Linear,
    Relu,
    Mish,
    Logistic,
}

impl Activation {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "leaky" => Some(Activation::Leaky),
            "linear" => Some(Activation::Linear),
            "relu" => Some(Activation::Relu),
            "mish" => Some(Activation::Mish),
            "logistic" => Some(Activation::Logistic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayerDef {
    Convolutional {
        batch_normalize: bool,
        filters: usize,
        size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
    },
    MaxPool {
        size: usize,
        stride: usize,
    },
    Upsample {
        stride: usize,
    },
    /// Layer offsets as written; negative values are relative to this layer.
    Route {
        layers: Vec<isize>,
    },
    Shortcut {
        from: isize,
    },
    Yolo {
        /// Anchor priors selected by `mask`, in input pixels.
        anchors: Vec<(f32, f32)>,
        classes: usize,
    },
}

#[derive(Debug, Clone)]
pub struct ModelDefinition {
    pub hyperparams: Hyperparams,
    pub layers: Vec<LayerDef>,
}

struct RawSection {
    kind: String,
    index: usize,
    entries: Vec<(String, String)>,
}

impl RawSection {
    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn missing(&self, key: &str) -> ConfigError {
        ConfigError::MissingKey {
            section: self.kind.clone(),
            index: self.index,
            key: key.to_string(),
        }
    }

    fn invalid(&self, key: &str, value: &str) -> ConfigError {
        ConfigError::InvalidValue {
            section: self.kind.clone(),
            index: self.index,
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self.get(key).ok_or_else(|| self.missing(key))?;
        value.parse().map_err(|_| self.invalid(key, value))
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(value) => value.parse().map_err(|_| self.invalid(key, value)),
            None => Ok(default),
        }
    }

    fn parse_list<T: FromStr>(&self, key: &str) -> Result<Vec<T>, ConfigError> {
        match self.get(key) {
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| v.parse().map_err(|_| self.invalid(key, value)))
                .collect(),
            None => Ok(Vec::new()),
        }
    }
}

fn split_sections(path: &Path, text: &str) -> Result<Vec<RawSection>, ConfigError> {
    let mut sections: Vec<RawSection> = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[') {
            let kind = header.trim_end_matches(']').trim().to_string();
            sections.push(RawSection {
                kind,
                index: sections.len(),
                entries: Vec::new(),
            });
            continue;
        }
        let syntax = |message: String| ConfigError::Syntax {
            path: path.to_path_buf(),
            line: idx + 1,
            message,
        };
        let Some((key, value)) = line.split_once('=') else {
            return Err(syntax(format!("expected `key=value`, got `{line}`")));
        };
        let Some(section) = sections.last_mut() else {
            return Err(syntax("option outside of any section".to_string()));
        };
        section
            .entries
            .push((key.trim().to_string(), value.trim().to_string()));
    }
    Ok(sections)
}

fn parse_hyperparams(net: &RawSection) -> Result<Hyperparams, ConfigError> {
    let optimizer = match net.get("optimizer") {
        Some(value) => value.parse()?,
        None => OptimizerKind::Adam,
    };
    let steps: Vec<usize> = net.parse_list("steps")?;
    let scales: Vec<f64> = net.parse_list("scales")?;
    if steps.len() != scales.len() {
        return Err(net.invalid(
            "scales",
            &format!("{} scales for {} steps", scales.len(), steps.len()),
        ));
    }

    let hyperparams = Hyperparams {
        batch: net.parse("batch")?,
        subdivisions: net.parse_or("subdivisions", 1)?,
        width: net.parse("width")?,
        height: net.parse("height")?,
        channels: net.parse_or("channels", CHANNELS)?,
        optimizer,
        momentum: net.parse_or("momentum", 0.9)?,
        decay: net.parse_or("decay", 0.0005)?,
        learning_rate: net.parse("learning_rate")?,
        burn_in: net.parse_or("burn_in", 0)?,
        max_batches: net.parse_or("max_batches", 0)?,
        policy: net.get("policy").unwrap_or("steps").to_string(),
        lr_steps: steps.into_iter().zip(scales).collect(),
    };

    if hyperparams.subdivisions == 0 {
        return Err(net.invalid("subdivisions", "0"));
    }
    if hyperparams.height != hyperparams.width {
        return Err(ConfigError::Architecture(format!(
            "height ({}) and width ({}) must be equal; non-square images are padded",
            hyperparams.height, hyperparams.width
        )));
    }
    if hyperparams.channels != CHANNELS {
        return Err(ConfigError::Architecture(format!(
            "only {CHANNELS}-channel input is supported, got {}",
            hyperparams.channels
        )));
    }
    Ok(hyperparams)
}

fn parse_layer(section: &RawSection) -> Result<LayerDef, ConfigError> {
    let layer = match section.kind.as_str() {
        "convolutional" => {
            let size: usize = section.parse_or("size", 1)?;
            let pad: usize = section.parse_or("pad", 0)?;
            let padding = if pad != 0 {
                size / 2
            } else {
                section.parse_or("padding", 0)?
            };
            let activation_str = section.get("activation").unwrap_or("linear");
            let activation = Activation::parse(activation_str)
                .ok_or_else(|| section.invalid("activation", activation_str))?;
            LayerDef::Convolutional {
                batch_normalize: section.parse_or::<usize>("batch_normalize", 0)? != 0,
                filters: section.parse("filters")?,
                size,
                stride: section.parse_or("stride", 1)?,
                padding,
                activation,
            }
        }
        "maxpool" => LayerDef::MaxPool {
            size: section.parse_or("size", 2)?,
            stride: section.parse_or("stride", 2)?,
        },
        "upsample" => LayerDef::Upsample {
            stride: section.parse_or("stride", 2)?,
        },
        "route" => {
            let layers: Vec<isize> = section.parse_list("layers")?;
            if layers.is_empty() {
                return Err(section.missing("layers"));
            }
            LayerDef::Route { layers }
        }
        "shortcut" => LayerDef::Shortcut {
            from: section.parse("from")?,
        },
        "yolo" => {
            let classes: usize = section.parse("classes")?;
            let flat: Vec<f32> = section.parse_list("anchors")?;
            if flat.is_empty() || flat.len() % 2 != 0 {
                return Err(section.invalid("anchors", section.get("anchors").unwrap_or("")));
            }
            let all: Vec<(f32, f32)> = flat.chunks(2).map(|p| (p[0], p[1])).collect();
            let mask: Vec<usize> = section.parse_list("mask")?;
            let anchors = if mask.is_empty() {
                all
            } else {
                mask.iter()
                    .map(|&m| {
                        all.get(m)
                            .copied()
                            .ok_or_else(|| section.invalid("mask", &m.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?
            };
            LayerDef::Yolo { anchors, classes }
        }
        other => return Err(ConfigError::UnsupportedLayer(other.to_string())),
    };
    Ok(layer)
}

pub fn parse_model_config(path: impl AsRef<Path>) -> Result<ModelDefinition, ConfigError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_model_definition(path, &text)
}

/// Parses definition text; `path` is only used in error messages.
pub fn parse_model_definition(path: &Path, text: &str) -> Result<ModelDefinition, ConfigError> {
    let sections = split_sections(path, text)?;
    let Some((net, rest)) = sections.split_first() else {
        return Err(ConfigError::Architecture("definition has no sections".into()));
    };
    if net.kind != "net" && net.kind != "network" {
        return Err(ConfigError::Architecture(format!(
            "first section must be [net], found [{}]",
            net.kind
        )));
    }
    let hyperparams = parse_hyperparams(net)?;
    let layers = rest.iter().map(parse_layer).collect::<Result<Vec<_>, _>>()?;
    if !layers.iter().any(|l| matches!(l, LayerDef::Yolo { .. })) {
        return Err(ConfigError::Architecture(
            "definition has no [yolo] detection head".into(),
        ));
    }
    Ok(ModelDefinition {
        hyperparams,
        layers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY: &str = "
[net]
# Training
batch=16
subdivisions=4
width=64
height=64
channels=3
momentum=0.9
decay=0.0005
learning_rate=0.001
burn_in=100
max_batches=2000
policy=steps
steps=1600,1800
scales=.1,.1

[convolutional]
batch_normalize=1
filters=8
size=3
stride=2
pad=1
activation=leaky

[maxpool]
size=2
stride=2

[convolutional]
size=1
stride=1
pad=1
filters=14
activation=linear

[yolo]
mask = 0,1
anchors = 10,14,  23,27,  37,58
classes=2
num=3
";

    fn parse(text: &str) -> Result<ModelDefinition, ConfigError> {
        parse_model_definition(Path::new("test.cfg"), text)
    }

    #[test]
    fn parses_hyperparams() {
        let def = parse(TINY).unwrap();
        let hp = &def.hyperparams;
        assert_eq!(hp.batch, 16);
        assert_eq!(hp.subdivisions, 4);
        assert_eq!(hp.mini_batch_size(), 4);
        assert_eq!(hp.height, 64);
        assert_eq!(hp.optimizer, OptimizerKind::Adam);
        assert_eq!(hp.burn_in, 100);
        assert_eq!(hp.lr_steps, vec![(1600, 0.1), (1800, 0.1)]);
    }

    #[test]
    fn parses_layers_and_masked_anchors() {
        let def = parse(TINY).unwrap();
        assert_eq!(def.layers.len(), 4);
        assert_eq!(
            def.layers[0],
            LayerDef::Convolutional {
                batch_normalize: true,
                filters: 8,
                size: 3,
                stride: 2,
                padding: 1,
                activation: Activation::Leaky,
            }
        );
        assert_eq!(def.layers[1], LayerDef::MaxPool { size: 2, stride: 2 });
        assert_eq!(
            def.layers[3],
            LayerDef::Yolo {
                anchors: vec![(10.0, 14.0), (23.0, 27.0)],
                classes: 2,
            }
        );
    }

    #[test]
    fn unknown_optimizer_is_rejected() {
        let text = TINY.replace("[net]\n", "[net]\noptimizer=rmsprop\n");
        assert!(matches!(parse(&text), Err(ConfigError::UnknownOptimizer(o)) if o == "rmsprop"));

        let text = TINY.replace("[net]\n", "[net]\noptimizer=SGD\n");
        assert_eq!(parse(&text).unwrap().hyperparams.optimizer, OptimizerKind::Sgd);
    }

    #[test]
    fn rejects_malformed_definitions() {
        assert!(matches!(
            parse(&TINY.replace("width=64", "width=32")),
            Err(ConfigError::Architecture(_))
        ));
        assert!(matches!(
            parse(&TINY.replace("batch=16", "batch=lots")),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse(&TINY.replace("[maxpool]", "[dropout]")),
            Err(ConfigError::UnsupportedLayer(_))
        ));
        assert!(matches!(
            parse(&TINY.replace("scales=.1,.1", "scales=.1")),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse(&TINY.replace("mask = 0,1", "mask = 0,5")),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse("batch=1\n"),
            Err(ConfigError::Syntax { line: 1, .. })
        ));
    }
}
