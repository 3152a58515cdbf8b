//! Histogram face descriptor.
//!
//! A detected face is cropped, resampled to a canonical square and summarized
//! by three 256-bin histograms concatenated in fixed order:
//! pixel intensity, 8-neighbor local binary pattern, and Canny edge map.
//! The result is L2-normalized so only the shape of the distribution matters.

use crate::detector::FaceDetector;
use crate::imgproc::{canny, crop, resize_bilinear};
use crate::types::{FaceRegion, FeatureVector, DESCRIPTOR_LEN, HISTOGRAM_BINS};
use thiserror::Error;

// --- Named constants (no magic numbers) ---
pub const CANONICAL_SIZE: usize = 100;
pub const CANNY_LOW: f32 = 50.0;
pub const CANNY_HIGH: f32 = 150.0;

/// Neighbor offsets (dx, dy) in clockwise order starting top-left.
/// The first offset sets bit 7, the last sets bit 0.
const LBP_NEIGHBORS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

pub type Histogram = [u32; HISTOGRAM_BINS];

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("no face detected")]
    NoFaceDetected,
}

/// Descriptor tuning constants. Enrollment and query must use the same values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DescriptorParams {
    /// Side of the square the face crop is resampled to.
    pub canonical_size: usize,
    pub canny_low: f32,
    pub canny_high: f32,
}

impl Default for DescriptorParams {
    fn default() -> Self {
        Self {
            canonical_size: CANONICAL_SIZE,
            canny_low: CANNY_LOW,
            canny_high: CANNY_HIGH,
        }
    }
}

/// Detector + descriptor builder: image bytes in, one feature vector out.
pub struct FeatureExtractor {
    detector: Box<dyn FaceDetector>,
    params: DescriptorParams,
}

impl FeatureExtractor {
    pub fn new(detector: impl FaceDetector + 'static, params: DescriptorParams) -> Self {
        Self {
            detector: Box::new(detector),
            params,
        }
    }

    /// Decode an encoded image (JPEG, PNG, ...) and describe its first face.
    pub fn extract(&self, image_bytes: &[u8]) -> Result<FeatureVector, ExtractError> {
        let gray = decode_grayscale(image_bytes)?;
        let (width, height) = gray.dimensions();
        self.extract_gray(gray.as_raw(), width, height)
    }

    /// Describe the first face found in a decoded grayscale frame.
    pub fn extract_gray(&self, gray: &[u8], width: u32, height: u32) -> Result<FeatureVector, ExtractError> {
        let region = self
            .detector
            .detect_first(gray, width, height)
            .ok_or(ExtractError::NoFaceDetected)?;

        tracing::debug!(?region, width, height, "face region selected");
        Ok(describe_region(gray, width, &region, &self.params))
    }
}

/// Decode any format the `image` crate understands into 8-bit grayscale.
pub fn decode_grayscale(image_bytes: &[u8]) -> Result<image::GrayImage, image::ImageError> {
    Ok(image::load_from_memory(image_bytes)?.to_luma8())
}

/// Crop `region` out of a `width`-wide frame and describe it.
pub fn describe_region(gray: &[u8], width: u32, region: &FaceRegion, params: &DescriptorParams) -> FeatureVector {
    let face = crop(gray, width, region);
    describe_patch(&face, region.width as usize, region.height as usize, params)
}

/// Resample a face patch to the canonical square and build its descriptor.
pub fn describe_patch(patch: &[u8], width: usize, height: usize, params: &DescriptorParams) -> FeatureVector {
    let size = params.canonical_size;
    let canonical = resize_bilinear(patch, width, height, size, size);

    let mut raw = Vec::with_capacity(DESCRIPTOR_LEN);
    raw.extend(intensity_histogram(&canonical).iter().map(|&c| c as f32));
    raw.extend(lbp_histogram(&canonical, size, size).iter().map(|&c| c as f32));
    raw.extend(
        edge_histogram(&canonical, size, size, params.canny_low, params.canny_high)
            .iter()
            .map(|&c| c as f32),
    );

    FeatureVector::normalized(raw)
}

/// Count of each gray level.
pub fn intensity_histogram(pixels: &[u8]) -> Histogram {
    let mut hist = [0u32; HISTOGRAM_BINS];
    for &p in pixels {
        hist[p as usize] += 1;
    }
    hist
}

/// 8-bit local binary pattern of the interior pixel at (x, y): bit k is set
/// when the neighbor at [`LBP_NEIGHBORS`]`[7 - k]` is >= the center.
pub fn lbp_code(pixels: &[u8], width: usize, x: usize, y: usize) -> u8 {
    let center = pixels[y * width + x];
    let mut code = 0u8;
    for &(dx, dy) in &LBP_NEIGHBORS {
        let nx = (x as i32 + dx) as usize;
        let ny = (y as i32 + dy) as usize;
        code = (code << 1) | (pixels[ny * width + nx] >= center) as u8;
    }
    code
}

/// Histogram of LBP codes over every interior pixel (1-pixel border excluded).
pub fn lbp_histogram(pixels: &[u8], width: usize, height: usize) -> Histogram {
    let mut hist = [0u32; HISTOGRAM_BINS];
    if width < 3 || height < 3 {
        return hist;
    }
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            hist[lbp_code(pixels, width, x, y) as usize] += 1;
        }
    }
    hist
}

/// Histogram of the binary Canny edge map (only bins 0 and 255 are populated).
pub fn edge_histogram(pixels: &[u8], width: usize, height: usize, low: f32, high: f32) -> Histogram {
    intensity_histogram(&canny(pixels, width, height, low, high))
}
