//! LSB Pair Analysis
//!
//! Statistical detection of least-significant-bit embedding. Natural images
//! show a measurable skew between the counts of adjacent even/odd intensity
//! values; LSB replacement flattens that skew. A chi-square goodness-of-fit
//! test against "each pair is balanced" therefore yields a *high* p-value on
//! suspicious images, and that high p-value is the alarm condition.

use image::{DynamicImage, GrayImage, ImageReader, Limits, Luma};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::io::Cursor;
use thiserror::Error;

use crate::Config;

/// Minimum number of observed counts (five qualifying pairs) for the test to run.
pub const MIN_OBSERVED_VALUES: usize = 10;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Insufficient data: {qualifying_pairs} qualifying intensity pairs (need {required})")]
    InsufficientData {
        qualifying_pairs: usize,
        required: usize,
    },
    #[error("Statistics error: {0}")]
    Statistics(String),
}

impl From<image::ImageError> for AnalysisError {
    fn from(err: image::ImageError) -> Self {
        AnalysisError::Decode(err.to_string())
    }
}

/// 256-bin intensity histogram of a grayscale sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntensityHistogram {
    counts: [u64; 256],
    total: u64,
}

impl IntensityHistogram {
    /// Build a histogram over flattened pixel intensities
    pub fn from_pixels(pixels: &[u8]) -> Self {
        let mut counts = [0u64; 256];
        for &value in pixels {
            counts[value as usize] += 1;
        }
        Self {
            counts,
            total: pixels.len() as u64,
        }
    }

    /// Build a histogram from precomputed counts
    pub fn from_counts(counts: [u64; 256]) -> Self {
        let total = counts.iter().sum();
        Self { counts, total }
    }

    pub fn count(&self, value: u8) -> u64 {
        self.counts[value as usize]
    }

    pub fn counts(&self) -> &[u64; 256] {
        &self.counts
    }

    /// Number of pixels the histogram was built from
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Statistics for each `(2i, 2i + 1)` pair, in ascending order
    pub fn pair_statistics(&self, min_pair_mean: f64) -> Vec<LsbPairStatistic> {
        self.counts
            .chunks_exact(2)
            .enumerate()
            .map(|(i, pair)| {
                let mean = (pair[0] + pair[1]) as f64 / 2.0;
                LsbPairStatistic {
                    even_value: (i * 2) as u8,
                    even_count: pair[0],
                    odd_count: pair[1],
                    mean,
                    qualifies: mean > min_pair_mean,
                }
            })
            .collect()
    }
}

/// Counts for one even/odd intensity pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LsbPairStatistic {
    pub even_value: u8,
    pub even_count: u64,
    pub odd_count: u64,
    pub mean: f64,
    /// Whether the pair has enough samples to take part in the test
    pub qualifies: bool,
}

/// Outcome of a conclusive LSB analysis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LsbVerdict {
    pub is_suspicious: bool,
    pub p_value: f64,
    pub chi_square: f64,
    pub degrees_of_freedom: usize,
    pub qualifying_pairs: usize,
}

/// Chi-square LSB pair analyzer
#[derive(Debug, Clone)]
pub struct LsbAnalyzer {
    suspicion_threshold: f64,
    min_pair_mean: f64,
    max_image_dimension: u32,
    max_decode_alloc_bytes: u64,
}

impl LsbAnalyzer {
    /// Create an analyzer with the default thresholds
    pub fn new() -> Self {
        Self::from_config(&Config::default())
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            suspicion_threshold: config.suspicion_threshold,
            min_pair_mean: config.min_pair_mean as f64,
            max_image_dimension: config.max_image_dimension,
            max_decode_alloc_bytes: config.max_decode_alloc_bytes,
        }
    }

    pub fn suspicion_threshold(&self) -> f64 {
        self.suspicion_threshold
    }

    /// Decode raw image bytes and run the pair test
    pub fn analyze(&self, bytes: &[u8]) -> Result<LsbVerdict, AnalysisError> {
        let sample = self.decode_grayscale(bytes)?;
        let histogram = IntensityHistogram::from_pixels(sample.as_raw());
        self.analyze_histogram(&histogram)
    }

    /// Decode PNG/JPEG/WebP bytes into 8-bit luma, honoring the size guard
    pub fn decode_grayscale(&self, bytes: &[u8]) -> Result<GrayImage, AnalysisError> {
        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| AnalysisError::Decode(e.to_string()))?;

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_image_dimension);
        limits.max_image_height = Some(self.max_image_dimension);
        limits.max_alloc = Some(self.max_decode_alloc_bytes);
        reader.limits(limits);

        Ok(to_gray_rec601(reader.decode()?))
    }

    /// Run the chi-square pair test on a histogram
    pub fn analyze_histogram(
        &self,
        histogram: &IntensityHistogram,
    ) -> Result<LsbVerdict, AnalysisError> {
        let mut observed = Vec::with_capacity(256);
        let mut expected = Vec::with_capacity(256);

        for pair in histogram
            .pair_statistics(self.min_pair_mean)
            .into_iter()
            .filter(|p| p.qualifies)
        {
            observed.push(pair.even_count as f64);
            observed.push(pair.odd_count as f64);
            expected.push(pair.mean);
            expected.push(pair.mean);
        }

        if observed.len() < MIN_OBSERVED_VALUES {
            return Err(AnalysisError::InsufficientData {
                qualifying_pairs: observed.len() / 2,
                required: MIN_OBSERVED_VALUES / 2,
            });
        }

        let chi_square = pearson_chi_square(&observed, &expected);
        let degrees_of_freedom = observed.len() - 1;
        let p_value = chi_square_survival(chi_square, degrees_of_freedom)?;

        Ok(LsbVerdict {
            is_suspicious: p_value > self.suspicion_threshold,
            p_value,
            chi_square,
            degrees_of_freedom,
            qualifying_pairs: observed.len() / 2,
        })
    }
}

impl Default for LsbAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Luma with ITU-R BT.601 weights in 14-bit fixed point, rounded
///
/// Grayscale inputs pass through untouched; alpha is ignored.
fn to_gray_rec601(image: DynamicImage) -> GrayImage {
    if !image.color().has_color() {
        return image.to_luma8();
    }
    let rgb = image.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let luma = (r as u32 * 4899 + g as u32 * 9617 + b as u32 * 1868 + 8192) >> 14;
        Luma([luma as u8])
    })
}

/// `Σ (O − E)² / E`
fn pearson_chi_square(observed: &[f64], expected: &[f64]) -> f64 {
    observed
        .iter()
        .zip(expected)
        .map(|(o, e)| (o - e).powi(2) / e)
        .sum()
}

fn chi_square_survival(statistic: f64, degrees_of_freedom: usize) -> Result<f64, AnalysisError> {
    let dist = ChiSquared::new(degrees_of_freedom as f64)
        .map_err(|e| AnalysisError::Statistics(e.to_string()))?;
    Ok(dist.sf(statistic))
}
