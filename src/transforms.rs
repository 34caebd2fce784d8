//! Image preprocessing: crop, resize, tensor conversion and normalization

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};

/// ImageNet channel means
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Preprocessing pipeline applied to every dataset image
///
/// Order: center crop (square, `center_crop` pixels, clipped to the image),
/// resize to `size` x `size`, convert to a `(3, H, W)` tensor in `[0, 1]`,
/// normalize with `mean` / `std`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Preprocess {
    pub center_crop: Option<u32>,
    pub size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for Preprocess {
    fn default() -> Self {
        Self {
            center_crop: Some(256),
            size: 224,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }
}

impl Preprocess {
    /// Crop and resize, returning the RGB image the network will see
    pub fn prepare_image(&self, image: &DynamicImage) -> RgbImage {
        let (w, h) = (image.width(), image.height());
        let cropped = match self.center_crop {
            Some(crop) => {
                let side = crop.min(w).min(h);
                let x = (w - side) / 2;
                let y = (h - side) / 2;
                image.crop_imm(x, y, side, side)
            }
            None => image.clone(),
        };
        cropped
            .resize_exact(self.size, self.size, FilterType::Triangle)
            .to_rgb8()
    }

    /// Full pipeline: image -> normalized `(3, size, size)` tensor on CPU
    pub fn apply(&self, image: &DynamicImage) -> Result<Tensor> {
        let rgb = self.prepare_image(image);
        self.to_tensor(&rgb)
    }

    /// Convert an RGB image to a normalized `(3, H, W)` tensor on CPU
    pub fn to_tensor(&self, rgb: &RgbImage) -> Result<Tensor> {
        let (w, h) = (rgb.width() as usize, rgb.height() as usize);
        let raw = rgb.as_raw().clone();
        let t = Tensor::from_vec(raw, (h, w, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?;
        let t = (t / 255.0)?;
        self.normalize(&t)
    }

    /// `(x - mean) / std` per channel for `(3, H, W)` or `(B, 3, H, W)` input
    pub fn normalize(&self, t: &Tensor) -> Result<Tensor> {
        let (mean, std) = self.channel_stats(t)?;
        Ok(t.broadcast_sub(&mean)?.broadcast_div(&std)?)
    }

    /// Inverse of [`Preprocess::normalize`]
    pub fn denormalize(&self, t: &Tensor) -> Result<Tensor> {
        let (mean, std) = self.channel_stats(t)?;
        Ok(t.broadcast_mul(&std)?.broadcast_add(&mean)?)
    }

    /// Turn a normalized `(3, H, W)` tensor back into a displayable image
    pub fn to_image(&self, t: &Tensor) -> Result<RgbImage> {
        let t = if t.rank() == 4 { t.get(0)? } else { t.clone() };
        let (c, h, w) = t.dims3()?;
        anyhow::ensure!(c == 3, "Expected 3 channels, got {c}");

        let pixels = self
            .denormalize(&t.to_device(&Device::Cpu)?.to_dtype(DType::F32)?)?
            .clamp(0f32, 1f32)?
            .affine(255.0, 0.0)?
            .round()?
            .permute((1, 2, 0))?
            .flatten_all()?
            .to_dtype(DType::U8)?
            .to_vec1::<u8>()?;

        RgbImage::from_raw(w as u32, h as u32, pixels)
            .ok_or_else(|| anyhow::anyhow!("Pixel buffer does not match {w}x{h}"))
    }

    fn channel_stats(&self, t: &Tensor) -> Result<(Tensor, Tensor)> {
        let device = t.device();
        let shape: &[usize] = if t.rank() == 4 {
            &[1, 3, 1, 1]
        } else {
            &[3, 1, 1]
        };
        let mean = Tensor::new(&self.mean, device)?.reshape(shape)?;
        let std = Tensor::new(&self.std, device)?.reshape(shape)?;
        Ok((mean, std))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_prepare_image_size() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 200, Rgb([10, 20, 30])));
        let prep = Preprocess::default();
        let out = prep.prepare_image(&img);
        assert_eq!(out.dimensions(), (224, 224));
    }

    #[test]
    fn test_tensor_normalization() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([255, 0, 128])));
        let prep = Preprocess {
            center_crop: None,
            size: 4,
            ..Default::default()
        };
        let t = prep.apply(&img).unwrap();
        assert_eq!(t.dims(), &[3, 4, 4]);

        let values: Vec<Vec<Vec<f32>>> = t.to_vec3().unwrap();
        let expected_r = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        let expected_g = (0.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        assert!((values[0][1][2] - expected_r).abs() < 1e-4);
        assert!((values[1][3][0] - expected_g).abs() < 1e-4);
    }

    #[test]
    fn test_denormalize_roundtrip_image() {
        let mut rgb = RgbImage::new(4, 4);
        for (x, y, px) in rgb.enumerate_pixels_mut() {
            *px = Rgb([(x * 60) as u8, (y * 60) as u8, 200]);
        }
        let prep = Preprocess::default();
        let t = prep.to_tensor(&rgb).unwrap();
        let back = prep.to_image(&t).unwrap();
        assert_eq!(back, rgb);
    }
}
