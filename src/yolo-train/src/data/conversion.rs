use crate::common::CHANNELS;

use burn::{prelude::*, tensor::Tensor};
use image::{RgbImage, imageops};

/// Nearest-neighbour resize of a square image to `size` x `size`.
pub fn resize_square(img: &RgbImage, size: usize) -> RgbImage {
    if img.width() as usize == size && img.height() as usize == size {
        return img.clone();
    }
    imageops::resize(img, size as u32, size as u32, imageops::FilterType::Nearest)
}

/// CHW floats in `[0, 1]`.
pub fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let hw = height * width;
    let mut buf = vec![0f32; CHANNELS * hw];
    for (x, y, p) in img.enumerate_pixels() {
        let idx = y as usize * width + x as usize;
        buf[idx] = p[0] as f32 / 255.0;
        buf[hw + idx] = p[1] as f32 / 255.0;
        buf[2 * hw + idx] = p[2] as f32 / 255.0;
    }
    buf
}

/// Stacks equally sized images into an `[N, 3, H, W]` tensor.
pub fn images_to_tensor<B: Backend>(images: &[RgbImage], device: &B::Device) -> Tensor<B, 4> {
    let (width, height) = images
        .first()
        .map(|img| (img.width() as usize, img.height() as usize))
        .unwrap_or((0, 0));
    let mut buf = Vec::with_capacity(images.len() * CHANNELS * width * height);
    for img in images {
        buf.extend(image_to_chw(img));
    }
    Tensor::<B, 4>::from_data(
        TensorData::new(buf, [images.len(), CHANNELS, height, width]).convert::<B::FloatElem>(),
        device,
    )
}
