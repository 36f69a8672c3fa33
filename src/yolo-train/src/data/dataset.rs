use super::{BoxLabel, DatasetError};
use burn::data::dataset::Dataset;
use image::{RgbImage, imageops};
use log::debug;
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// A decoded image padded to a square, with its labels relative to the square.
#[derive(Debug, Clone)]
pub struct DetectionItem {
    pub path: PathBuf,
    pub image: RgbImage,
    pub labels: Vec<BoxLabel>,
}

pub type SampleResult = Result<DetectionItem, DatasetError>;

/// An image and its label file, decoded by the batcher.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRef {
    pub image: PathBuf,
    pub label: PathBuf,
}

impl SampleRef {
    pub fn load(&self) -> SampleResult {
        load_sample(&self.image, &self.label)
    }
}

/// Images named by a list file, labelled Darknet-style.
#[derive(Debug, Clone)]
pub struct ListDataset {
    entries: Vec<SampleRef>,
}

impl ListDataset {
    pub fn from_list_file(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| DatasetError::ListFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let images = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from);
        Self::from_image_paths(images)
    }

    pub fn from_image_paths(
        images: impl IntoIterator<Item = PathBuf>,
    ) -> Result<Self, DatasetError> {
        let entries = images
            .into_iter()
            .map(|image| {
                let label = label_path_for(&image)?;
                Ok(SampleRef { image, label })
            })
            .collect::<Result<Vec<_>, DatasetError>>()?;
        Ok(Self { entries })
    }

    pub fn image_path(&self, index: usize) -> Option<&Path> {
        self.entries.get(index).map(|e| e.image.as_path())
    }
}

impl Dataset<SampleRef> for ListDataset {
    fn get(&self, index: usize) -> Option<SampleRef> {
        self.entries.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// `…/images/…/x.jpg` → `…/labels/…/x.txt`, replacing the last `images`.
pub fn label_path_for(image: &Path) -> Result<PathBuf, DatasetError> {
    let parent = image
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let Some(pos) = parent.rfind("images") else {
        return Err(DatasetError::LabelPath(image.to_path_buf()));
    };
    let label_dir = format!("{}labels{}", &parent[..pos], &parent[pos + "images".len()..]);
    let stem = image
        .file_stem()
        .ok_or_else(|| DatasetError::LabelPath(image.to_path_buf()))?;
    Ok(Path::new(&label_dir).join(stem).with_extension("txt"))
}

fn load_sample(image_path: &Path, label_path: &Path) -> SampleResult {
    let image = image::open(image_path)
        .map_err(|e| DatasetError::Image {
            path: image_path.to_path_buf(),
            message: e.to_string(),
        })?
        .to_rgb8();
    let labels = read_labels(label_path)?;
    let (image, labels) = pad_to_square(&image, labels);
    Ok(DetectionItem {
        path: image_path.to_path_buf(),
        image,
        labels,
    })
}

/// Missing label files mean the image has no objects.
pub fn read_labels(path: &Path) -> Result<Vec<BoxLabel>, DatasetError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("no label file at {}", path.display());
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(DatasetError::Label {
                path: path.to_path_buf(),
                line: 0,
                message: e.to_string(),
            });
        }
    };

    let mut labels = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let err = |message: String| DatasetError::Label {
            path: path.to_path_buf(),
            line: idx + 1,
            message,
        };
        let values = line
            .split_whitespace()
            .map(|v| v.parse::<f32>().map_err(|_| err(format!("not a number: `{v}`"))))
            .collect::<Result<Vec<_>, _>>()?;
        let [class, cx, cy, w, h] = values[..] else {
            return Err(err(format!("expected 5 values, got {}", values.len())));
        };
        if class < 0.0 || class.fract() != 0.0 {
            return Err(err(format!("invalid class id {class}")));
        }
        labels.push(BoxLabel {
            class: class as usize,
            cx,
            cy,
            w,
            h,
        });
    }
    Ok(labels)
}

/// Centres the image on a black square and re-normalises the labels to it.
pub fn pad_to_square(image: &RgbImage, labels: Vec<BoxLabel>) -> (RgbImage, Vec<BoxLabel>) {
    let (w, h) = image.dimensions();
    if w == h {
        return (image.clone(), labels);
    }
    let side = w.max(h);
    let pad_x = (side - w) / 2;
    let pad_y = (side - h) / 2;

    let mut square = RgbImage::new(side, side);
    imageops::replace(&mut square, image, pad_x as i64, pad_y as i64);

    let (wf, hf, sf) = (w as f32, h as f32, side as f32);
    let labels = labels
        .into_iter()
        .map(|l| BoxLabel {
            class: l.class,
            cx: (l.cx * wf + pad_x as f32) / sf,
            cy: (l.cy * hf + pad_y as f32) / sf,
            w: l.w * wf / sf,
            h: l.h * hf / sf,
        })
        .collect();
    (square, labels)
}
