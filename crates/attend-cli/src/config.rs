use attend_core::descriptor::{CANNY_HIGH, CANNY_LOW, CANONICAL_SIZE};
use attend_core::detector::{default_cascade_path, DEFAULT_MIN_NEIGHBORS, DEFAULT_SCALE_FACTOR};
use attend_core::matcher::{ACCEPT_THRESHOLD, AMBIGUITY_CUTOFF, AMBIGUITY_MARGIN};
use attend_core::{CascadeParams, DescriptorParams, MatchPolicy};
use std::path::PathBuf;

/// CLI configuration, loaded from environment variables.
pub struct Config {
    /// Root for the record database, gallery file and uploaded images.
    pub data_dir: PathBuf,
    /// OpenCV Haar cascade used for face detection.
    pub cascade_path: PathBuf,
    /// Minimum cosine similarity for an accepted identification.
    pub accept_threshold: f32,
    pub ambiguity_cutoff: f32,
    pub ambiguity_margin: f32,
    pub scale_factor: f64,
    pub min_neighbors: usize,
    pub canny_low: f32,
    pub canny_high: f32,
}

impl Config {
    /// Load configuration from `ATTEND_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("ATTEND_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("attend")
        });

        let parsed = |key: &str| var(key).and_then(|v| v.parse::<f64>().ok());

        Self {
            data_dir,
            cascade_path: var("ATTEND_CASCADE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_cascade_path),
            accept_threshold: parsed("ATTEND_ACCEPT_THRESHOLD").map_or(ACCEPT_THRESHOLD, |v| v as f32),
            ambiguity_cutoff: parsed("ATTEND_AMBIGUITY_CUTOFF").map_or(AMBIGUITY_CUTOFF, |v| v as f32),
            ambiguity_margin: parsed("ATTEND_AMBIGUITY_MARGIN").map_or(AMBIGUITY_MARGIN, |v| v as f32),
            scale_factor: parsed("ATTEND_SCALE_FACTOR").unwrap_or(DEFAULT_SCALE_FACTOR),
            min_neighbors: var("ATTEND_MIN_NEIGHBORS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MIN_NEIGHBORS),
            canny_low: parsed("ATTEND_CANNY_LOW").map_or(CANNY_LOW, |v| v as f32),
            canny_high: parsed("ATTEND_CANNY_HIGH").map_or(CANNY_HIGH, |v| v as f32),
        }
    }

    /// SQLite database holding profiles and attendance.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("attend.db")
    }

    /// Persisted identity → vector mapping.
    pub fn gallery_path(&self) -> PathBuf {
        self.data_dir.join("gallery.json")
    }

    /// Held while a gallery rebuild runs; shared by every `attend` process
    /// using this data dir.
    pub fn run_lock_path(&self) -> PathBuf {
        self.data_dir.join("reembed.lock")
    }

    /// Stored enrollment images.
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            ambiguity_cutoff: self.ambiguity_cutoff,
            ambiguity_margin: self.ambiguity_margin,
            accept_threshold: self.accept_threshold,
        }
    }

    pub fn cascade_params(&self) -> CascadeParams {
        CascadeParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
        }
    }

    pub fn descriptor_params(&self) -> DescriptorParams {
        DescriptorParams {
            canonical_size: CANONICAL_SIZE,
            canny_low: self.canny_low,
            canny_high: self.canny_high,
        }
    }
}
