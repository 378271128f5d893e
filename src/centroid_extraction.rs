//! Extract star centroids from a grayscale image.
//!
//! Pipeline:
//! 1. Optionally bin the image `n × n` (faster on large sensors).
//! 2. Estimate the background (global or block-wise local statistic) and subtract it.
//! 3. Estimate the residual noise and threshold at `sigma_threshold × noise`.
//! 4. Optionally open the detection mask with a 3×3 element to drop hot pixels.
//! 5. Label 8-connected blobs.
//! 6. Reject blobs by area, flux, elongation and saturation.
//! 7. Compute intensity-weighted sub-pixel centroids, sort brightest first.
//!
//! Coordinates follow [`Centroid`]: origin at the top-left image corner, the centre
//! of pixel `(r, c)` at `(r + 0.5, c + 0.5)`.
//!
//! # Example
//!
//! ```
//! use starfix::centroid_extraction::{extract, CentroidExtractionConfig, GrayImage};
//!
//! let pixels = vec![10.0_f32; 64 * 64];
//! let image = GrayImage::new(&pixels, 64, 64).unwrap();
//! let centroids = extract(&image, &CentroidExtractionConfig::default()).unwrap();
//! assert!(centroids.is_empty());
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ensure_config, Error, Result};
use crate::Centroid;

/// Borrowed row-major grayscale pixel grid.
#[derive(Debug, Clone, Copy)]
pub struct GrayImage<'a> {
    pixels: &'a [f32],
    width: u32,
    height: u32,
}

impl<'a> GrayImage<'a> {
    /// Wrap a row-major buffer of `width * height` intensities.
    pub fn new(pixels: &'a [f32], width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(Error::InvalidImage(format!(
                "pixel buffer has {} values, expected {}x{}={}",
                pixels.len(),
                width,
                height,
                expected
            )));
        }
        if width == 0 || height == 0 {
            return Err(Error::InvalidImage(format!(
                "image dimensions must be non-zero, got {width}x{height}"
            )));
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// `(height, width)`, the order used for image sizes across the crate.
    pub fn size(&self) -> (u32, u32) {
        (self.height, self.width)
    }

    pub fn pixels(&self) -> &'a [f32] {
        self.pixels
    }
}

/// How the sky background is estimated before thresholding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BackgroundMode {
    /// One level for the whole image: the median pixel value.
    GlobalMedian,
    /// One level for the whole image: the mean pixel value.
    GlobalMean,
    /// Block medians on a `block_size` grid, bilinearly interpolated between
    /// block centres. Follows gradients from vignetting or nebulosity.
    LocalMedian { block_size: u32 },
    /// Like `LocalMedian` but with block means.
    LocalMean { block_size: u32 },
}

/// How the residual noise level is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseMode {
    /// `1.4826 × median(|r - median(r)|)`, robust to stars in the frame.
    MedianAbsolute,
    /// Sigma-clipped standard deviation of the residual.
    RootMeanSquare,
}

/// Configuration for centroid extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentroidExtractionConfig {
    /// Default: `LocalMedian { block_size: 64 }`.
    pub background: BackgroundMode,
    /// Default: `MedianAbsolute`.
    pub noise: NoiseMode,
    /// Detection threshold in units of the noise estimate. Default 5.0.
    pub sigma_threshold: f32,
    /// Fixed threshold on the background-subtracted image; overrides `sigma_threshold`.
    pub absolute_threshold: Option<f32>,
    /// Open the detection mask with a 3×3 element. Default true.
    pub binary_open: bool,
    /// Minimum blob area in (detection-image) pixels. Default 3.
    pub min_area: usize,
    /// Maximum blob area in (detection-image) pixels. Default 400.
    pub max_area: usize,
    /// Minimum background-subtracted flux of a blob.
    pub min_flux: Option<f32>,
    /// Maximum background-subtracted flux of a blob.
    pub max_flux: Option<f32>,
    /// Maximum major/minor axis ratio. Default 3.0; rejects streaks and cosmic rays.
    pub max_axis_ratio: Option<f32>,
    /// Blobs containing a raw pixel at or above this level are rejected as saturated.
    pub saturation_level: Option<f32>,
    /// Keep only the brightest `n` centroids.
    pub max_centroids: Option<usize>,
    /// Bin the image by this factor before detection.
    pub downsample: Option<u32>,
    /// Clipping passes for `NoiseMode::RootMeanSquare`. Default 5.
    pub sigma_clip_iterations: usize,
}

impl Default for CentroidExtractionConfig {
    fn default() -> Self {
        Self {
            background: BackgroundMode::LocalMedian { block_size: 64 },
            noise: NoiseMode::MedianAbsolute,
            sigma_threshold: 5.0,
            absolute_threshold: None,
            binary_open: true,
            min_area: 3,
            max_area: 400,
            min_flux: None,
            max_flux: None,
            max_axis_ratio: Some(3.0),
            saturation_level: None,
            max_centroids: None,
            downsample: None,
            sigma_clip_iterations: 5,
        }
    }
}

impl CentroidExtractionConfig {
    pub fn validate(&self) -> Result<()> {
        ensure_config!(
            self.sigma_threshold.is_finite() && self.sigma_threshold > 0.0,
            "sigma_threshold must be positive, got {}",
            self.sigma_threshold
        );
        if let Some(t) = self.absolute_threshold {
            ensure_config!(t.is_finite() && t >= 0.0, "absolute_threshold must be >= 0, got {t}");
        }
        ensure_config!(self.min_area >= 1, "min_area must be at least 1");
        ensure_config!(
            self.max_area >= self.min_area,
            "max_area ({}) is smaller than min_area ({})",
            self.max_area,
            self.min_area
        );
        if let (Some(lo), Some(hi)) = (self.min_flux, self.max_flux) {
            ensure_config!(hi >= lo, "max_flux ({hi}) is smaller than min_flux ({lo})");
        }
        if let Some(r) = self.max_axis_ratio {
            ensure_config!(r >= 1.0, "max_axis_ratio must be >= 1, got {r}");
        }
        if let BackgroundMode::LocalMedian { block_size }
        | BackgroundMode::LocalMean { block_size } = self.background
        {
            ensure_config!(block_size >= 2, "background block_size must be >= 2, got {block_size}");
        }
        if let Some(n) = self.downsample {
            ensure_config!(n >= 1, "downsample factor must be >= 1");
        }
        Ok(())
    }
}

/// Shape and brightness of one accepted detection, parallel to the centroid list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlobStats {
    /// Pixel count in the detection image.
    pub area: usize,
    /// Background-subtracted flux (sum of positive residuals).
    pub flux: f32,
    /// Largest background-subtracted pixel value.
    pub peak: f32,
    /// Major/minor axis ratio from second moments (1 = round).
    pub axis_ratio: f32,
}

/// Centroids plus the statistics that produced them.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    /// Brightest first.
    pub centroids: Vec<Centroid>,
    /// `blobs[i]` describes `centroids[i]`.
    pub blobs: Vec<BlobStats>,
    /// Median of the background model.
    pub background_level: f32,
    pub noise_sigma: f32,
    /// Threshold applied to the background-subtracted image.
    pub threshold: f32,
    /// Connected blobs before any filtering.
    pub num_blobs_raw: usize,
}

/// Extract centroids, brightest first. Returns an empty list when nothing qualifies.
pub fn extract(image: &GrayImage, config: &CentroidExtractionConfig) -> Result<Vec<Centroid>> {
    Ok(extract_with_stats(image, config)?.centroids)
}

/// Extract centroids and keep the per-blob statistics and thresholds.
pub fn extract_with_stats(
    image: &GrayImage,
    config: &CentroidExtractionConfig,
) -> Result<ExtractionResult> {
    config.validate()?;

    let factor = config.downsample.unwrap_or(1).max(1);
    let binned;
    let (work, peaks, width, height): (&[f32], &[f32], usize, usize) = if factor > 1 {
        binned = Binned::new(image, factor as usize);
        (&binned.sums, &binned.peaks, binned.width, binned.height)
    } else {
        (
            image.pixels,
            image.pixels,
            image.width as usize,
            image.height as usize,
        )
    };

    let background = background_model(work, width, height, config.background);
    let background_level = background.median();
    let residual: Vec<f32> = work
        .iter()
        .enumerate()
        .map(|(i, &v)| v - background.at(i))
        .collect();

    let noise_sigma = noise_level(&residual, config.noise, config.sigma_clip_iterations);
    let threshold = config
        .absolute_threshold
        .unwrap_or(config.sigma_threshold * noise_sigma);

    let mut mask: Vec<bool> = residual.iter().map(|&r| r > threshold).collect();
    if config.binary_open {
        mask = open_3x3(&mask, width, height);
    }

    let blobs = label_blobs(&mask, width, height);
    let num_blobs_raw = blobs.len();

    let mut detections: Vec<(Centroid, BlobStats)> = blobs
        .iter()
        .filter_map(|pixels| measure_blob(pixels, &residual, peaks, width, config))
        .collect();

    detections.sort_by(|a, b| {
        b.1.flux
            .total_cmp(&a.1.flux)
            .then_with(|| a.0.row.total_cmp(&b.0.row))
            .then_with(|| a.0.col.total_cmp(&b.0.col))
    });
    if let Some(max) = config.max_centroids {
        detections.truncate(max);
    }

    let scale = factor as f32;
    let (centroids, blobs): (Vec<Centroid>, Vec<BlobStats>) = detections
        .into_iter()
        .map(|(c, stats)| {
            (
                Centroid {
                    row: c.row * scale,
                    col: c.col * scale,
                    weight: c.weight,
                },
                stats,
            )
        })
        .unzip();

    debug!(
        "Extracted {} centroids from {} blobs (background {:.2}, sigma {:.3}, threshold {:.3})",
        centroids.len(),
        num_blobs_raw,
        background_level,
        noise_sigma,
        threshold
    );

    Ok(ExtractionResult {
        centroids,
        blobs,
        background_level,
        noise_sigma,
        threshold,
        num_blobs_raw,
    })
}

/// Grayscale intensities of a decoded image as `(pixels, width, height)`.
///
/// 8- and 16-bit luma images keep their raw values; everything else is
/// converted to 16-bit luma first.
#[cfg(feature = "image")]
pub fn luma_pixels(img: &image::DynamicImage) -> (Vec<f32>, u32, u32) {
    use image::DynamicImage;
    let (width, height) = (img.width(), img.height());
    let pixels = match img {
        DynamicImage::ImageLuma8(g) => g.as_raw().iter().map(|&v| v as f32).collect(),
        DynamicImage::ImageLuma16(g) => g.as_raw().iter().map(|&v| v as f32).collect(),
        other => other.to_luma16().as_raw().iter().map(|&v| v as f32).collect(),
    };
    (pixels, width, height)
}

/// Extract centroids from a decoded [`image::DynamicImage`].
#[cfg(feature = "image")]
pub fn extract_from_dynamic_image(
    img: &image::DynamicImage,
    config: &CentroidExtractionConfig,
) -> Result<ExtractionResult> {
    let (pixels, width, height) = luma_pixels(img);
    let view = GrayImage::new(&pixels, width, height)?;
    extract_with_stats(&view, config)
}

// ── Binning ─────────────────────────────────────────────────────────────────

struct Binned {
    sums: Vec<f32>,
    /// Brightest raw pixel in each bin, for saturation checks.
    peaks: Vec<f32>,
    width: usize,
    height: usize,
}

impl Binned {
    /// Sum `factor × factor` bins; a partial last row/column of bins is dropped.
    fn new(image: &GrayImage, factor: usize) -> Self {
        let src_w = image.width as usize;
        let width = (src_w / factor).max(1);
        let height = (image.height as usize / factor).max(1);
        let mut sums = vec![0.0f32; width * height];
        let mut peaks = vec![f32::NEG_INFINITY; width * height];
        let rows = (height * factor).min(image.height as usize);
        let cols = (width * factor).min(src_w);
        for r in 0..rows {
            let out_row = (r / factor) * width;
            for c in 0..cols {
                let v = image.pixels[r * src_w + c];
                let o = out_row + c / factor;
                sums[o] += v;
                peaks[o] = peaks[o].max(v);
            }
        }
        Self {
            sums,
            peaks,
            width,
            height,
        }
    }
}

// ── Background ──────────────────────────────────────────────────────────────

enum Background {
    Flat(f32),
    Grid {
        values: Vec<f32>,
    },
}

impl Background {
    fn at(&self, idx: usize) -> f32 {
        match self {
            Background::Flat(level) => *level,
            Background::Grid { values } => values[idx],
        }
    }

    fn median(&self) -> f32 {
        match self {
            Background::Flat(level) => *level,
            Background::Grid { values } => median(&mut values.clone()),
        }
    }
}

fn background_model(
    pixels: &[f32],
    width: usize,
    height: usize,
    mode: BackgroundMode,
) -> Background {
    match mode {
        BackgroundMode::GlobalMedian => Background::Flat(median(&mut finite(pixels))),
        BackgroundMode::GlobalMean => Background::Flat(mean(pixels)),
        BackgroundMode::LocalMedian { block_size } => Background::Grid {
            values: interpolate_blocks(pixels, width, height, block_size as usize, |vals| {
                median(vals)
            }),
        },
        BackgroundMode::LocalMean { block_size } => Background::Grid {
            values: interpolate_blocks(pixels, width, height, block_size as usize, |vals| {
                mean(vals)
            }),
        },
    }
}

/// Evaluate `stat` on each `block × block` tile and interpolate bilinearly
/// between tile centres.
fn interpolate_blocks<F>(
    pixels: &[f32],
    width: usize,
    height: usize,
    block: usize,
    mut stat: F,
) -> Vec<f32>
where
    F: FnMut(&mut Vec<f32>) -> f32,
{
    let nx = width.div_ceil(block);
    let ny = height.div_ceil(block);
    let mut grid = vec![0.0f32; nx * ny];
    let mut scratch = Vec::with_capacity(block * block);
    for by in 0..ny {
        for bx in 0..nx {
            scratch.clear();
            for r in by * block..((by + 1) * block).min(height) {
                let row = &pixels[r * width..(r + 1) * width];
                scratch.extend(
                    row[bx * block..((bx + 1) * block).min(width)]
                        .iter()
                        .copied()
                        .filter(|v| v.is_finite()),
                );
            }
            grid[by * nx + bx] = if scratch.is_empty() { 0.0 } else { stat(&mut scratch) };
        }
    }

    // Fractional tile coordinate of a pixel centre; beyond the outermost
    // centres the nearest pair of tiles is extrapolated linearly
    let tile_coord = |p: usize, n: usize| -> (usize, usize, f32) {
        if n == 1 {
            return (0, 0, 0.0);
        }
        let t = (p as f32 + 0.5) / block as f32 - 0.5;
        let i0 = (t.floor().max(0.0) as usize).min(n - 2);
        (i0, i0 + 1, t - i0 as f32)
    };
    let cols: Vec<(usize, usize, f32)> = (0..width).map(|c| tile_coord(c, nx)).collect();

    let mut out = vec![0.0f32; width * height];
    for r in 0..height {
        let (y0, y1, fy) = tile_coord(r, ny);
        for (c, &(x0, x1, fx)) in cols.iter().enumerate() {
            let top = lerp(grid[y0 * nx + x0], grid[y0 * nx + x1], fx);
            let bottom = lerp(grid[y1 * nx + x0], grid[y1 * nx + x1], fx);
            out[r * width + c] = lerp(top, bottom, fy);
        }
    }
    out
}

/// Exact when `a == b`, so a flat background stays flat.
#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

// ── Noise ───────────────────────────────────────────────────────────────────

fn noise_level(residual: &[f32], mode: NoiseMode, clip_iterations: usize) -> f32 {
    let mut values = finite(residual);
    if values.is_empty() {
        return 0.0;
    }
    match mode {
        NoiseMode::MedianAbsolute => {
            let center = median(&mut values);
            let mut deviations: Vec<f32> = values.iter().map(|v| (v - center).abs()).collect();
            1.4826 * median(&mut deviations)
        }
        NoiseMode::RootMeanSquare => {
            let mut sigma = 0.0f32;
            for _ in 0..clip_iterations.max(1) {
                let m = mean(&values);
                let var = values.iter().map(|&v| ((v - m) as f64).powi(2)).sum::<f64>()
                    / values.len() as f64;
                sigma = var.sqrt() as f32;
                let before = values.len();
                values.retain(|&v| (v - m).abs() <= 3.0 * sigma);
                if values.len() == before || values.is_empty() {
                    break;
                }
            }
            sigma
        }
    }
}

// ── Mask morphology and labelling ───────────────────────────────────────────

/// Morphological opening (erode then dilate) with a 3×3 square element.
/// Everything outside the image counts as background.
fn open_3x3(mask: &[bool], width: usize, height: usize) -> Vec<bool> {
    let neighborhood = |m: &[bool], r: usize, c: usize, all: bool| -> bool {
        let mut any = false;
        for dr in -1i64..=1 {
            for dc in -1i64..=1 {
                let (rr, cc) = (r as i64 + dr, c as i64 + dc);
                let inside = rr >= 0 && cc >= 0 && (rr as usize) < height && (cc as usize) < width;
                let set = inside && m[rr as usize * width + cc as usize];
                if all && !set {
                    return false;
                }
                any |= set;
            }
        }
        all || any
    };

    let mut eroded = vec![false; mask.len()];
    for r in 0..height {
        for c in 0..width {
            if mask[r * width + c] {
                eroded[r * width + c] = neighborhood(mask, r, c, true);
            }
        }
    }
    let mut opened = vec![false; mask.len()];
    for r in 0..height {
        for c in 0..width {
            if mask[r * width + c] {
                opened[r * width + c] = neighborhood(&eroded, r, c, false);
            }
        }
    }
    opened
}

/// 8-connected components of `mask`, each as a list of pixel indices.
/// Blobs are discovered in raster order.
fn label_blobs(mask: &[bool], width: usize, height: usize) -> Vec<Vec<usize>> {
    let mut visited = vec![false; mask.len()];
    let mut blobs = Vec::new();
    let mut stack = Vec::new();

    for seed in 0..mask.len() {
        if !mask[seed] || visited[seed] {
            continue;
        }
        visited[seed] = true;
        stack.push(seed);
        let mut pixels = Vec::new();
        while let Some(idx) = stack.pop() {
            pixels.push(idx);
            let (r, c) = ((idx / width) as i64, (idx % width) as i64);
            for dr in -1..=1 {
                for dc in -1..=1 {
                    let (rr, cc) = (r + dr, c + dc);
                    if rr < 0 || cc < 0 || rr >= height as i64 || cc >= width as i64 {
                        continue;
                    }
                    let n = rr as usize * width + cc as usize;
                    if mask[n] && !visited[n] {
                        visited[n] = true;
                        stack.push(n);
                    }
                }
            }
        }
        pixels.sort_unstable();
        blobs.push(pixels);
    }
    blobs
}

// ── Per-blob measurement ────────────────────────────────────────────────────

fn measure_blob(
    pixels: &[usize],
    residual: &[f32],
    raw_peaks: &[f32],
    width: usize,
    config: &CentroidExtractionConfig,
) -> Option<(Centroid, BlobStats)> {
    let area = pixels.len();
    if area < config.min_area || area > config.max_area {
        return None;
    }
    if let Some(level) = config.saturation_level {
        if pixels.iter().any(|&i| raw_peaks[i] >= level) {
            return None;
        }
    }

    // Moments relative to the first pixel keep the sums small
    let (r0, c0) = ((pixels[0] / width) as f64, (pixels[0] % width) as f64);
    let (mut s, mut sr, mut sc, mut srr, mut scc, mut src) = (0.0f64, 0.0, 0.0, 0.0, 0.0, 0.0);
    let mut peak = f32::NEG_INFINITY;
    for &i in pixels {
        let w = residual[i].max(0.0) as f64;
        let dr = (i / width) as f64 - r0;
        let dc = (i % width) as f64 - c0;
        s += w;
        sr += w * dr;
        sc += w * dc;
        srr += w * dr * dr;
        scc += w * dc * dc;
        src += w * dr * dc;
        peak = peak.max(residual[i]);
    }
    if s <= 0.0 {
        return None;
    }
    let flux = s as f32;
    if config.min_flux.is_some_and(|lo| flux < lo) || config.max_flux.is_some_and(|hi| flux > hi) {
        return None;
    }

    let (mr, mc) = (sr / s, sc / s);
    let vrr = srr / s - mr * mr;
    let vcc = scc / s - mc * mc;
    let vrc = src / s - mr * mc;
    let half_trace = 0.5 * (vrr + vcc);
    let disc = (0.25 * (vrr - vcc).powi(2) + vrc * vrc).sqrt();
    let (major, minor) = (half_trace + disc, (half_trace - disc).max(0.0));
    let axis_ratio = if major <= 1e-12 {
        1.0
    } else {
        (major / minor.max(1e-6 * major).max(1e-12)).sqrt() as f32
    };
    if config.max_axis_ratio.is_some_and(|limit| axis_ratio > limit) {
        return None;
    }

    let centroid = Centroid {
        row: (r0 + mr + 0.5) as f32,
        col: (c0 + mc + 0.5) as f32,
        weight: Some(flux),
    };
    Some((
        centroid,
        BlobStats {
            area,
            flux,
            peak,
            axis_ratio,
        },
    ))
}

// ── Small statistics helpers ────────────────────────────────────────────────

fn finite(values: &[f32]) -> Vec<f32> {
    values.iter().copied().filter(|v| v.is_finite()).collect()
}

/// Median by selection; reorders `values`. Empty input gives 0.
fn median(values: &mut Vec<f32>) -> f32 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    let (_, &mut upper, _) = values.select_nth_unstable_by(n / 2, |a, b| a.total_cmp(b));
    if n % 2 == 1 {
        return upper;
    }
    let lower = values[..n / 2]
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    0.5 * (lower + upper)
}

fn mean(values: &[f32]) -> f32 {
    let (sum, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0f64, 0usize), |(s, n), &v| (s + v as f64, n + 1));
    if count == 0 {
        0.0
    } else {
        (sum / count as f64) as f32
    }
}
