use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of values in a [`FeatureVector`]: intensity, local-pattern and edge
/// histograms of 256 bins each.
pub const DESCRIPTOR_LEN: usize = 3 * HISTOGRAM_BINS;

/// Bins per histogram (one per 8-bit grayscale level / pattern code).
pub const HISTOGRAM_BINS: usize = 256;

/// Floor added to the Euclidean norm before dividing.
pub const NORM_EPSILON: f32 = 1e-7;

/// Rectangle around a detected face, in source image pixels.
///
/// Always non-empty and fully inside the image it was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    /// Build a region from signed detector coordinates, clipped to a
    /// `img_width` × `img_height` image. Returns `None` if nothing remains.
    pub fn clipped(x: i32, y: i32, width: i32, height: i32, img_width: u32, img_height: u32) -> Option<Self> {
        let x0 = x.max(0) as i64;
        let y0 = y.max(0) as i64;
        let x1 = (x as i64 + width as i64).min(img_width as i64);
        let y1 = (y as i64 + height as i64).min(img_height as i64);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(Self {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// L2-normalized face descriptor.
///
/// Produced once per image by the descriptor builder and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    /// Normalize raw histogram counts: divide by `‖raw‖ + ε`.
    ///
    /// An all-zero input stays all-zero instead of producing NaNs.
    pub fn normalized(mut raw: Vec<f32>) -> Self {
        l2_normalize(&mut raw);
        Self { values: raw }
    }

    /// Wrap values that are already normalized (e.g. read back from disk).
    pub fn from_values(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &FeatureVector) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }
}

/// `dot(a, b) / (‖a‖ ‖b‖)`, or 0 when either norm is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 { dot / denom } else { 0.0 }
}

/// Divide every value by the Euclidean norm plus [`NORM_EPSILON`].
pub fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    let denom = norm + NORM_EPSILON;
    for v in values.iter_mut() {
        *v /= denom;
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity must not be empty")]
    Empty,
}

/// Normalized handle for an enrolled person: lower-case, whitespace → `_`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::Empty);
        }

        let handle = trimmed
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect::<String>()
            .to_lowercase();

        Ok(Self(handle))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Human-readable form: `jane_doe` → `Jane Doe`.
    ///
    /// Each `_` becomes one space and words are title-cased, so runs of
    /// underscores keep their width.
    pub fn display_name(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        let mut word_start = true;
        for c in self.0.chars() {
            if c.is_alphabetic() {
                if word_start {
                    out.extend(c.to_uppercase());
                } else {
                    out.extend(c.to_lowercase());
                }
                word_start = false;
            } else {
                out.push(if c == '_' { ' ' } else { c });
                word_start = true;
            }
        }
        out
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Why an identification did not produce an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Best and second-best scores are too close to call.
    Ambiguous,
    /// Best score is under the acceptance threshold.
    BelowThreshold,
    NoFace,
    GalleryEmpty,
    /// A re-embedding run is rebuilding the gallery.
    PipelineBusy,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::Ambiguous => "ambiguous",
            RejectReason::BelowThreshold => "below_threshold",
            RejectReason::NoFace => "no_face",
            RejectReason::GalleryEmpty => "gallery_empty",
            RejectReason::PipelineBusy => "pipeline_busy",
        };
        f.write_str(s)
    }
}

/// Outcome of identifying a probe against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Matched identity; `None` whenever `rejected` is set.
    pub identity: Option<Identity>,
    /// Best cosine similarity, clamped to [0, 1].
    pub confidence: f32,
    pub rejected: Option<RejectReason>,
}

impl MatchResult {
    pub fn accepted(identity: Identity, confidence: f32) -> Self {
        Self {
            identity: Some(identity),
            confidence: confidence.clamp(0.0, 1.0),
            rejected: None,
        }
    }

    pub fn rejected(reason: RejectReason, confidence: f32) -> Self {
        Self {
            identity: None,
            confidence: confidence.clamp(0.0, 1.0),
            rejected: Some(reason),
        }
    }

    pub fn is_match(&self) -> bool {
        self.rejected.is_none() && self.identity.is_some()
    }
}

/// Whether a re-embedding run is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingState {
    Idle,
    Running,
}

impl fmt::Display for TrainingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrainingState::Idle => "idle",
            TrainingState::Running => "running",
        })
    }
}
