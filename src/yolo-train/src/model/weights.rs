use crate::{
    config::parse_model_config,
    model::{Detector, ModelError, blocks::DarknetConvWeights, darknet::DetectorRecord},
};

use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use log::{info, warn};
use std::{fs, path::Path};

/// Builds the detector described by `definition`, optionally starting from `pretrained`.
///
/// `pretrained` is read as Darknet weights (`.weights`), a PyTorch state dict
/// (`.pt`, `.pth`) or a checkpoint written by this crate (anything else).
pub fn load_model<B: Backend>(
    definition: impl AsRef<Path>,
    pretrained: Option<&Path>,
    device: &B::Device,
) -> Result<Detector<B>, ModelError> {
    let definition = parse_model_config(definition)?;
    let model = Detector::from_definition(&definition, device)?;

    let Some(path) = pretrained else {
        return Ok(model);
    };
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let model = match extension.as_str() {
        "weights" | "74" | "15" => load_darknet_weights(model, path)?,
        "pt" | "pth" => load_pytorch_state_dict(model, path, device)?,
        _ => {
            let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
            model
                .load_file(path.to_path_buf(), &recorder, device)
                .map_err(|e| ModelError::Checkpoint {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?
        }
    };
    info!("Loaded pretrained weights from {}", path.display());
    Ok(model)
}

/// Backbone-only files stop after a fixed number of layers.
fn darknet_cutoff(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_string_lossy();
    if name.contains("darknet53.conv.74") {
        Some(75)
    } else if name.contains("yolov3-tiny.conv.15") {
        Some(15)
    } else {
        None
    }
}

struct WeightCursor<'a> {
    values: &'a [f32],
    pos: usize,
}

impl WeightCursor<'_> {
    fn take(&mut self, len: usize) -> Option<Vec<f32>> {
        let end = self.pos.checked_add(len)?;
        let slice = self.values.get(self.pos..end)?;
        self.pos = end;
        Some(slice.to_vec())
    }

    fn remaining(&self) -> usize {
        self.values.len() - self.pos
    }
}

/// Darknet header: major, minor, revision as `i32`, then `seen` as `u64`
/// (versions from 0.2) or `u32`; the rest is raw little endian `f32`s.
fn parse_darknet_header(bytes: &[u8]) -> Option<(u64, usize)> {
    let word = |i: usize| -> Option<u32> {
        let b = bytes.get(i * 4..i * 4 + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    };
    let (major, minor) = (word(0)?, word(1)?);
    if major * 10 + minor >= 2 && major < 1000 && minor < 1000 {
        let seen = u64::from(word(3)?) | (u64::from(word(4)?) << 32);
        Some((seen, 20))
    } else {
        Some((u64::from(word(3)?), 16))
    }
}

pub fn load_darknet_weights<B: Backend>(
    mut model: Detector<B>,
    path: &Path,
) -> Result<Detector<B>, ModelError> {
    let error = |message: String| ModelError::Weights {
        path: path.to_path_buf(),
        message,
    };
    let bytes = fs::read(path).map_err(|e| error(e.to_string()))?;
    let (seen, header_len) =
        parse_darknet_header(&bytes).ok_or_else(|| error("truncated header".into()))?;
    let values: Vec<f32> = bytes[header_len..]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let mut cursor = WeightCursor {
        values: &values,
        pos: 0,
    };

    let cutoff = darknet_cutoff(path);
    for (index, layer) in model.layers.iter_mut().enumerate() {
        if Some(index) == cutoff {
            break;
        }
        let Some(conv) = layer.conv.take() else {
            continue;
        };
        let out = conv.out_channels();
        let weight_len = conv.darknet_len() - if conv.norm.is_some() { 4 * out } else { out };
        let truncated = || error(format!("file ends inside layer {index}"));

        let norm = if conv.norm.is_some() {
            let mut take = || cursor.take(out).ok_or_else(truncated);
            Some([take()?, take()?, take()?, take()?])
        } else {
            None
        };
        let bias = if conv.conv.bias.is_some() {
            Some(cursor.take(out).ok_or_else(truncated)?)
        } else {
            None
        };
        let weight = cursor.take(weight_len).ok_or_else(truncated)?;
        layer.conv = Some(conv.with_darknet_weights(DarknetConvWeights { norm, bias, weight }));
    }

    if cursor.remaining() > 0 && cutoff.is_none() {
        warn!(
            "{} unused values at the end of {}",
            cursor.remaining(),
            path.display()
        );
    }
    model.set_seen(seen);
    Ok(model)
}

/// State dicts name convolutions `module_list.<i>.conv_<i>` and
/// batch norms `module_list.<i>.batch_norm_<i>`.
pub fn load_pytorch_state_dict<B: Backend>(
    model: Detector<B>,
    path: &Path,
    device: &B::Device,
) -> Result<Detector<B>, ModelError> {
    let load_args = LoadArgs::new(path.to_path_buf())
        .with_key_remap(r"^module_list\.(\d+)\.conv_\d+\.(.+)$", "layers.$1.conv.conv.$2")
        .with_key_remap(
            r"^module_list\.(\d+)\.batch_norm_\d+\.(.+)$",
            "layers.$1.conv.norm.$2",
        );

    let record: DetectorRecord<B> = PyTorchFileRecorder::<FullPrecisionSettings>::default()
        .load(load_args, device)
        .map_err(|e| ModelError::Weights {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    Ok(model.load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use std::io::Write;

    type TestBackend = NdArray;

    const CFG: &str = "
[net]
batch=1
width=8
height=8
learning_rate=0.01

[convolutional]
batch_normalize=1
filters=2
size=1
stride=1
activation=leaky

[convolutional]
filters=6
size=1
stride=1
activation=linear

[yolo]
mask=0
anchors=4,4
classes=1
";

    fn write_weights(path: &Path, seen: u64, values: &[f32]) {
        let mut file = fs::File::create(path).unwrap();
        for word in [0u32, 2, 0] {
            file.write_all(&word.to_le_bytes()).unwrap();
        }
        file.write_all(&seen.to_le_bytes()).unwrap();
        for v in values {
            file.write_all(&v.to_le_bytes()).unwrap();
        }
    }

    #[test]
    fn darknet_weights_restore_parameters_and_seen() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("tiny.cfg");
        fs::write(&cfg, CFG).unwrap();

        // bn: beta, gamma, mean, var (2 each) + conv 2x3; then bias 6 + conv 6x2
        let values: Vec<f32> = (0..(8 + 6 + 6 + 12)).map(|v| v as f32).collect();
        let weights = dir.path().join("tiny.weights");
        write_weights(&weights, 1234, &values);

        let model = load_model::<TestBackend>(&cfg, Some(&weights), &Default::default()).unwrap();
        assert_eq!(model.seen(), 1234);

        let first = model.layers[0].conv.as_ref().unwrap();
        let norm = first.norm.as_ref().unwrap();
        assert_eq!(norm.beta.val().into_data().to_vec::<f32>().unwrap(), vec![0.0, 1.0]);
        assert_eq!(
            norm.running_var.value().into_data().to_vec::<f32>().unwrap(),
            vec![6.0, 7.0]
        );
        let head = model.layers[1].conv.as_ref().unwrap();
        let bias = head.conv.bias.as_ref().unwrap().val();
        assert_eq!(bias.into_data().to_vec::<f32>().unwrap()[0], 14.0);
    }

    #[test]
    fn truncated_weights_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("tiny.cfg");
        fs::write(&cfg, CFG).unwrap();
        let weights = dir.path().join("short.weights");
        write_weights(&weights, 0, &[1.0; 10]);

        let result = load_model::<TestBackend>(&cfg, Some(&weights), &Default::default());
        assert!(matches!(result, Err(ModelError::Weights { .. })));
    }

    #[test]
    fn missing_native_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("tiny.cfg");
        fs::write(&cfg, CFG).unwrap();
        let result = load_model::<TestBackend>(
            &cfg,
            Some(&dir.path().join("nothing.mpk")),
            &Default::default(),
        );
        assert!(matches!(result, Err(ModelError::Checkpoint { .. })));
    }
}
