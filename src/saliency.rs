//! Capacity to saliency-map conversion
//!
//! Capacity is per unit and in nats. A saliency map sums it over channels,
//! converts to bits and spreads the bits of each activation cell over the
//! input pixels it covers, so the map's total stays the same after resizing.

use ndarray::{Array2, Array3, Axis};
use serde::Serialize;

/// Bits per pixel over an image
#[derive(Debug, Clone)]
pub struct Heatmap {
    map: Array2<f32>,
}

impl Heatmap {
    pub fn new(map: Array2<f32>) -> Self {
        Self { map }
    }

    pub fn height(&self) -> usize {
        self.map.nrows()
    }

    pub fn width(&self) -> usize {
        self.map.ncols()
    }

    /// Largest value (0.0 for an empty map)
    pub fn max(&self) -> f32 {
        self.map.iter().copied().fold(0.0, f32::max)
    }

    /// Total bits over the image
    pub fn total(&self) -> f32 {
        self.map.sum()
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.map
    }

    pub fn into_inner(self) -> Array2<f32> {
        self.map
    }

    /// Values scaled into `[0, 1]` by `vmax` (the map's maximum when `None`)
    pub fn normalized(&self, vmax: Option<f32>) -> Array2<f32> {
        let vmax = vmax.unwrap_or_else(|| self.max());
        if vmax <= 0.0 {
            return Array2::zeros(self.map.raw_dim());
        }
        self.map.mapv(|v| (v / vmax).clamp(0.0, 1.0))
    }

    /// Row-major values, for JSON export
    pub fn to_rows(&self) -> Vec<Vec<f32>> {
        self.map.rows().into_iter().map(|r| r.to_vec()).collect()
    }
}

/// Heatmap values and summary statistics for JSON export
#[derive(Debug, Clone, Serialize)]
pub struct HeatmapExport {
    pub height: usize,
    pub width: usize,
    pub max: f32,
    pub total: f32,
    pub values: Vec<Vec<f32>>,
}

impl From<&Heatmap> for HeatmapExport {
    fn from(heatmap: &Heatmap) -> Self {
        Self {
            height: heatmap.height(),
            width: heatmap.width(),
            max: heatmap.max(),
            total: heatmap.total(),
            values: heatmap.to_rows(),
        }
    }
}

/// Convert capacity `(C, H, W)` in nats to a saliency map in bits
///
/// With `shape = Some((h, w))` the map is rescaled by `(H * W) / (h * w)`
/// and bilinearly resized to `(h, w)`. NaNs count as zero.
pub fn to_saliency_map(capacity: &Array3<f32>, shape: Option<(usize, usize)>) -> Array2<f32> {
    let bits = capacity
        .mapv(|v| if v.is_nan() { 0.0 } else { v })
        .sum_axis(Axis(0))
        / std::f32::consts::LN_2;

    match shape {
        Some((h, w)) => {
            let (ho, wo) = bits.dim();
            let scale = (ho * wo) as f32 / (h * w) as f32;
            resize_bilinear(&(bits * scale), h, w)
        }
        None => bits,
    }
}

/// Bilinear resize with pixel-centre alignment and mirrored borders
pub fn resize_bilinear(src: &Array2<f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (in_h, in_w) = src.dim();
    if (in_h, in_w) == (out_h, out_w) {
        return src.clone();
    }
    if in_h == 0 || in_w == 0 {
        return Array2::zeros((out_h, out_w));
    }

    let rows: Vec<(usize, usize, f32)> = (0..out_h)
        .map(|y| sample_coord(y, in_h, out_h))
        .collect();
    let cols: Vec<(usize, usize, f32)> = (0..out_w)
        .map(|x| sample_coord(x, in_w, out_w))
        .collect();

    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let (y0, y1, fy) = rows[y];
        let (x0, x1, fx) = cols[x];
        let top = src[[y0, x0]] * (1.0 - fx) + src[[y0, x1]] * fx;
        let bottom = src[[y1, x0]] * (1.0 - fx) + src[[y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

/// Neighbouring source indices and interpolation weight for output index `i`
fn sample_coord(i: usize, n_in: usize, n_out: usize) -> (usize, usize, f32) {
    if n_in == 1 {
        return (0, 0, 0.0);
    }
    let scale = n_in as f32 / n_out as f32;
    let last = (n_in - 1) as f32;
    let mut pos = (i as f32 + 0.5) * scale - 0.5;
    if pos < 0.0 {
        pos = -pos;
    }
    if pos > last {
        pos = 2.0 * last - pos;
    }
    let pos = pos.clamp(0.0, last);
    let i0 = pos.floor() as usize;
    let i1 = (i0 + 1).min(n_in - 1);
    (i0, i1, pos - i0 as f32)
}
