use super::BoxLabel;
use image::{Rgb, RgbImage, imageops};
use imageproc::noise::gaussian_noise;
use rand::{Rng, rngs::StdRng};

#[derive(Debug, Clone)]
pub struct AugmentationConfig {
    /// Probability of a horizontal flip (boxes are mirrored too)
    pub flip_prob: f32,
    /// Contrast adjustment range: (min, max multiplier)
    pub contrast_range: (f32, f32),
    /// Brightness adjustment range: (min, max delta)
    pub brightness_range: (f32, f32),
    /// Probability of applying Gaussian noise
    pub gaussian_prob: f32,
    /// Gaussian noise standard deviation, in 0..255 pixel units
    pub gaussian_noise_std: f64,
    pub gaussian_noise_mean: f64,
    /// Random erasing probability
    pub erasing_prob: f32,
    /// Random erasing area: (min, max ratio)
    pub erasing_area: (f32, f32),
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        AugmentationConfig {
            flip_prob: 0.5,
            contrast_range: (0.8, 1.2),
            brightness_range: (-0.1, 0.1),
            gaussian_prob: 0.3,
            gaussian_noise_std: 4.0,
            gaussian_noise_mean: 0.0,
            erasing_prob: 0.25,
            erasing_area: (0.02, 0.1),
        }
    }
}

/// Photometric and box-aware geometric augmentation of training samples.
#[derive(Debug, Clone, Default)]
pub struct ImageAugmenter {
    config: AugmentationConfig,
}

impl ImageAugmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        ImageAugmenter { config }
    }

    pub fn augment(
        &self,
        img: &RgbImage,
        labels: &mut [BoxLabel],
        rng: &mut StdRng,
    ) -> RgbImage {
        let mut out_img = self.flip_image(img, labels, rng);
        out_img = self.random_contrast_brightness(&out_img, rng);
        out_img = self.noise_image(&out_img, rng);
        self.random_erasing(&out_img, rng)
    }

    fn flip_image(&self, img: &RgbImage, labels: &mut [BoxLabel], rng: &mut StdRng) -> RgbImage {
        if rng.random::<f32>() >= self.config.flip_prob {
            return img.clone();
        }
        for label in labels.iter_mut() {
            label.cx = 1.0 - label.cx;
        }
        imageops::flip_horizontal(img)
    }

    fn noise_image(&self, img: &RgbImage, rng: &mut StdRng) -> RgbImage {
        let seed = rng.random::<u64>();
        if rng.random::<f32>() < self.config.gaussian_prob {
            gaussian_noise(
                img,
                self.config.gaussian_noise_mean,
                self.config.gaussian_noise_std,
                seed,
            )
        } else {
            img.clone()
        }
    }

    /// Cutout: with probability erasing_prob, a rectangle covering a random share
    /// of the image is filled with a random colour or the mean colour.
    fn random_erasing(&self, img: &RgbImage, rng: &mut StdRng) -> RgbImage {
        if rng.random::<f32>() >= self.config.erasing_prob {
            return img.clone();
        }

        let img_area = img.width() as f32 * img.height() as f32;
        let area_ratio = rng.random_range(self.config.erasing_area.0..=self.config.erasing_area.1);
        let target_area = area_ratio * img_area;
        let aspect_ratio = rng.random_range(0.3f32..=3.3f32);

        let cut_w = ((target_area * aspect_ratio).sqrt().round().max(1.0) as u32).min(img.width());
        let cut_h = ((target_area / aspect_ratio).sqrt().round().max(1.0) as u32).min(img.height());

        let x0 = rng.random_range(0..=(img.width() - cut_w));
        let y0 = rng.random_range(0..=(img.height() - cut_h));

        let fill_color = if rng.random::<f32>() < 0.5 {
            Rgb([rng.random(), rng.random(), rng.random()])
        } else {
            mean_color(img)
        };

        let mut out_buf = img.clone();
        for yy in y0..(y0 + cut_h) {
            for xx in x0..(x0 + cut_w) {
                out_buf.put_pixel(xx, yy, fill_color);
            }
        }
        out_buf
    }

    /// Contrast is multiplicative around 128, brightness an additive fraction of 255.
    fn random_contrast_brightness(&self, img: &RgbImage, rng: &mut StdRng) -> RgbImage {
        let contrast =
            rng.random_range(self.config.contrast_range.0..=self.config.contrast_range.1);
        let brightness_frac =
            rng.random_range(self.config.brightness_range.0..=self.config.brightness_range.1);
        let brightness_delta = brightness_frac * 255.0;

        let mut out_buf = img.clone();
        for pixel in out_buf.pixels_mut() {
            for c in pixel.0.iter_mut() {
                let vv = (*c as f32 - 128.0) * contrast + 128.0 + brightness_delta;
                *c = vv.clamp(0.0, 255.0) as u8;
            }
        }
        out_buf
    }
}

fn mean_color(img: &RgbImage) -> Rgb<u8> {
    let mut sum = [0u64; 3];
    for p in img.pixels() {
        for c in 0..3 {
            sum[c] += p[c] as u64;
        }
    }
    let total = ((img.width() as u64) * (img.height() as u64)).max(1);
    Rgb([
        (sum[0] / total) as u8,
        (sum[1] / total) as u8,
        (sum[2] / total) as u8,
    ])
}
