//! attend-core: face identification engine for attendance tracking.
//!
//! Detects faces with a Haar cascade, describes them with intensity, LBP and
//! edge histograms, and matches probes against an in-memory gallery that is
//! rebuilt in the background whenever enrollments change.

pub mod cascade;
pub mod descriptor;
pub mod detector;
pub mod engine;
pub mod gallery;
pub mod imgproc;
pub mod matcher;
pub mod pipeline;
pub mod runlock;
pub mod types;

pub use descriptor::{DescriptorParams, ExtractError, FeatureExtractor};
pub use detector::{CascadeDetector, CascadeParams, FaceDetector, FullFrameDetector};
pub use engine::FaceEngine;
pub use gallery::{Gallery, GalleryStore, JsonGalleryFile};
pub use matcher::{CosineMatcher, MatchPolicy, Matcher};
pub use pipeline::{EnrollmentSource, ReembedPipeline, RunOutcome, RunReport, SourceError, Trigger};
pub use runlock::RunLock;
pub use types::{FaceRegion, FeatureVector, Identity, MatchResult, RejectReason, TrainingState};
