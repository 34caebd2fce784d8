//! Heatmap rendering: half-seismic overlay with a colorbar
//!
//! The source image is underlaid in greyscale. Each heatmap pixel gets a
//! colour from the upper half of the seismic colormap (white, red, dark red)
//! and an opacity growing linearly with its value, so low-information
//! regions show the image and high-information regions show the heat.

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::saliency::Heatmap;

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Overlay appearance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayOptions {
    /// Opacity of a zero-valued pixel over the image
    pub min_alpha: f32,
    /// Opacity of a pixel at `vmax` over the image
    pub max_alpha: f32,
    /// Top of the colour scale; the heatmap maximum when `None`
    pub vmax: Option<f32>,
    pub colorbar_width: u32,
    pub colorbar_pad: u32,
    /// Colorbar caption, drawn only when a font is available
    pub colorbar_label: String,
    pub font_size: f32,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            min_alpha: 0.2,
            max_alpha: 0.7,
            vmax: None,
            colorbar_width: 16,
            colorbar_pad: 8,
            colorbar_label: "Bits / Pixel".to_string(),
            font_size: 14.0,
        }
    }
}

/// Upper half of matplotlib's seismic colormap at `t` in `[0, 1]`
///
/// `0.0` is white, `0.5` pure red and `1.0` dark red `(0.5, 0, 0)`.
pub fn half_seismic(t: f32) -> [f32; 3] {
    let t = t.clamp(0.0, 1.0);
    if t <= 0.5 {
        let fade = 1.0 - 2.0 * t;
        [1.0, fade, fade]
    } else {
        [1.0 - (t - 0.5), 0.0, 0.0]
    }
}

/// Colormap opacity used when there is no image underneath
fn standalone_alpha(t: f32) -> f32 {
    0.2 + 0.8 * t
}

fn blend(base: [f32; 3], over: [f32; 3], alpha: f32) -> Rgba<u8> {
    let mix = |b: f32, o: f32| ((alpha * o + (1.0 - alpha) * b) * 255.0).round() as u8;
    Rgba([
        mix(base[0], over[0]),
        mix(base[1], over[1]),
        mix(base[2], over[2]),
        255,
    ])
}

fn grey(pixel: &Rgb<u8>) -> [f32; 3] {
    let g = pixel.0.iter().map(|&v| v as f32).sum::<f32>() / (3.0 * 255.0);
    [g, g, g]
}

/// Load a TrueType/OpenType font for labels
pub fn load_font(path: &Path) -> Result<FontVec> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read font {}", path.display()))?;
    FontVec::try_from_vec(bytes).with_context(|| format!("Invalid font file {}", path.display()))
}

/// Draw the heatmap, optionally over `image`, with a colorbar on the right
///
/// `image` must have the heatmap's size. With a font, the colorbar gets its
/// range and caption, and `label` is written above the map.
pub fn render_overlay(
    heatmap: &Heatmap,
    image: Option<&RgbImage>,
    label: Option<&str>,
    font: Option<&FontVec>,
    options: &OverlayOptions,
) -> Result<RgbaImage> {
    let (h, w) = (heatmap.height() as u32, heatmap.width() as u32);
    anyhow::ensure!(h > 0 && w > 0, "Cannot render an empty heatmap");
    if let Some(img) = image {
        anyhow::ensure!(
            img.dimensions() == (w, h),
            "Image is {}x{} but the heatmap is {}x{}",
            img.width(),
            img.height(),
            w,
            h
        );
    }

    let vmax = options.vmax.unwrap_or_else(|| heatmap.max());
    let norm = heatmap.normalized(Some(vmax));
    let scale = PxScale::from(options.font_size);
    let text_room = if font.is_some() {
        (options.font_size * 4.0) as u32
    } else {
        0
    };
    let header = match (font, label) {
        (Some(_), Some(_)) => (options.font_size * 1.6) as u32,
        _ => 0,
    };

    let canvas_w = w + options.colorbar_pad + options.colorbar_width + text_room;
    let canvas_h = h + header;
    let mut canvas = RgbaImage::from_pixel(canvas_w, canvas_h, WHITE);

    for y in 0..h {
        for x in 0..w {
            let t = norm[[y as usize, x as usize]];
            let colour = half_seismic(t);
            let pixel = match image {
                Some(img) => {
                    let alpha = (options.max_alpha - options.min_alpha) * t + options.min_alpha;
                    blend(grey(img.get_pixel(x, y)), colour, alpha)
                }
                None => blend([1.0; 3], colour, standalone_alpha(t)),
            };
            canvas.put_pixel(x, y + header, pixel);
        }
    }

    // Colorbar: vmax at the top, zero at the bottom
    let bar_x = (w + options.colorbar_pad) as i32;
    for row in 0..h {
        let t = if h > 1 {
            1.0 - row as f32 / (h - 1) as f32
        } else {
            1.0
        };
        let colour = blend([1.0; 3], half_seismic(t), standalone_alpha(t));
        draw_filled_rect_mut(
            &mut canvas,
            Rect::at(bar_x, (row + header) as i32).of_size(options.colorbar_width, 1),
            colour,
        );
    }

    if let Some(font) = font {
        let text_x = bar_x + options.colorbar_width as i32 + 2;
        let bottom = (h + header) as i32 - options.font_size as i32;
        draw_text_mut(
            &mut canvas,
            BLACK,
            text_x,
            header as i32,
            scale,
            font,
            &format!("{vmax:.2}"),
        );
        draw_text_mut(&mut canvas, BLACK, text_x, bottom.max(0), scale, font, "0");
        let middle = (header + h / 2) as i32 - options.font_size as i32 / 2;
        draw_text_mut(
            &mut canvas,
            BLACK,
            text_x,
            middle,
            scale,
            font,
            &options.colorbar_label,
        );
        if let Some(label) = label {
            draw_text_mut(&mut canvas, BLACK, 2, 2, scale, font, label);
        }
    } else if label.is_some() {
        debug!("No font loaded; heatmap label not drawn");
    }

    Ok(canvas)
}

/// Write a rendered heatmap as PNG
pub fn save_png(image: &RgbaImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    image
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_half_seismic_endpoints() {
        assert_eq!(half_seismic(0.0), [1.0, 1.0, 1.0]);
        assert_eq!(half_seismic(0.5), [1.0, 0.0, 0.0]);
        assert_eq!(half_seismic(1.0), [0.5, 0.0, 0.0]);
        assert_eq!(half_seismic(2.0), [0.5, 0.0, 0.0]);
        let mid = half_seismic(0.25);
        assert!((mid[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_canvas_size_without_font() {
        let heatmap = Heatmap::new(ndarray::Array2::zeros((10, 12)));
        let options = OverlayOptions::default();
        let out = render_overlay(&heatmap, None, Some("tench"), None, &options).unwrap();
        assert_eq!(
            out.dimensions(),
            (12 + options.colorbar_pad + options.colorbar_width, 10)
        );
    }

    #[test]
    fn test_overlay_alpha_follows_heat() {
        let heatmap = Heatmap::new(array![[0.0f32, 1.0]]);
        let image = RgbImage::from_pixel(2, 1, Rgb([0, 0, 0]));
        let out = render_overlay(
            &heatmap,
            Some(&image),
            None,
            None,
            &OverlayOptions::default(),
        )
        .unwrap();

        // Zero heat: white at 0.2 opacity over black
        assert_eq!(out.get_pixel(0, 0), &Rgba([51, 51, 51, 255]));
        // Full heat: dark red at 0.7 opacity over black
        assert_eq!(out.get_pixel(1, 0), &Rgba([89, 0, 0, 255]));
    }

    #[test]
    fn test_colorbar_runs_from_dark_to_light() {
        let heatmap = Heatmap::new(ndarray::Array2::from_elem((20, 5), 1.0));
        let options = OverlayOptions::default();
        let out = render_overlay(&heatmap, None, None, None, &options).unwrap();
        let x = 5 + options.colorbar_pad + 1;
        assert_eq!(out.get_pixel(x, 0), &Rgba([128, 0, 0, 255]));
        assert_eq!(out.get_pixel(x, 19), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_rejects_mismatched_image() {
        let heatmap = Heatmap::new(ndarray::Array2::zeros((4, 4)));
        let image = RgbImage::new(5, 4);
        let result = render_overlay(
            &heatmap,
            Some(&image),
            None,
            None,
            &OverlayOptions::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_save_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("heatmap.png");
        let heatmap = Heatmap::new(array![[0.0f32, 0.5], [1.0, 2.0]]);
        let out = render_overlay(&heatmap, None, None, None, &OverlayOptions::default()).unwrap();
        save_png(&out, &path).unwrap();
        let back = image::open(&path).unwrap();
        assert_eq!(back.width(), out.width());
    }

    #[test]
    fn test_missing_font_is_an_error() {
        assert!(load_font(Path::new("/nonexistent/font.ttf")).is_err());
    }
}
