//! Recognition engine: the surface the request layer talks to.
//!
//! Wires detector, descriptor builder, gallery store, matcher and the
//! re-embedding pipeline together. Identification reads the current gallery
//! snapshot and never waits on a rebuild.

use crate::descriptor::{ExtractError, FeatureExtractor};
use crate::gallery::GalleryStore;
use crate::matcher::{CosineMatcher, MatchPolicy, Matcher};
use crate::pipeline::{EnrollmentSource, PipelineError, ReembedPipeline, SourceError, Trigger};
use crate::runlock::RunLock;
use crate::types::{FeatureVector, Identity, MatchResult, RejectReason, TrainingState};
use std::sync::Arc;

pub struct FaceEngine {
    extractor: Arc<FeatureExtractor>,
    gallery: Arc<GalleryStore>,
    source: Arc<dyn EnrollmentSource>,
    pipeline: ReembedPipeline,
    matcher: CosineMatcher,
    policy: MatchPolicy,
}

impl FaceEngine {
    pub fn new(
        extractor: FeatureExtractor,
        gallery: GalleryStore,
        source: Arc<dyn EnrollmentSource>,
        policy: MatchPolicy,
    ) -> Self {
        let extractor = Arc::new(extractor);
        let gallery = Arc::new(gallery);
        let pipeline = ReembedPipeline::new(Arc::clone(&extractor), Arc::clone(&source), Arc::clone(&gallery));

        Self {
            extractor,
            gallery,
            source,
            pipeline,
            matcher: CosineMatcher::from_policy(&policy),
            policy,
        }
    }

    /// Share run state with every other engine pointed at the same lock
    /// file: only one of them rebuilds at a time, and all of them report
    /// `running` and refuse identification while it does.
    pub fn with_run_lock(mut self, lock: RunLock) -> Self {
        self.pipeline = ReembedPipeline::with_run_lock(
            Arc::clone(&self.extractor),
            Arc::clone(&self.source),
            Arc::clone(&self.gallery),
            lock,
        );
        self
    }

    /// Decode, detect and describe. Decode failures and missing faces are
    /// typed results, not crashes.
    pub fn extract_features(&self, image_bytes: &[u8]) -> Result<FeatureVector, ExtractError> {
        self.extractor.extract(image_bytes)
    }

    /// Match a probe vector against the current gallery snapshot.
    ///
    /// Reports `pipeline_busy` while a rebuild is in progress rather than
    /// matching against a gallery that is about to be replaced.
    pub fn identify(&self, probe: &FeatureVector) -> MatchResult {
        if self.pipeline.state() == TrainingState::Running {
            tracing::info!("identification refused: re-embedding in progress");
            return MatchResult::rejected(RejectReason::PipelineBusy, 0.0);
        }

        let gallery = self.gallery.snapshot();
        self.matcher.compare(probe, &gallery, self.policy.accept_threshold)
    }

    /// Extract + identify in one step. A face-less image is a `no_face`
    /// rejection; only undecodable input is an error.
    pub fn identify_image(&self, image_bytes: &[u8]) -> Result<MatchResult, ExtractError> {
        match self.extract_features(image_bytes) {
            Ok(probe) => Ok(self.identify(&probe)),
            Err(ExtractError::NoFaceDetected) => {
                tracing::debug!("no face in probe image");
                Ok(MatchResult::rejected(RejectReason::NoFace, 0.0))
            }
            Err(e) => Err(e),
        }
    }

    /// Kick a background rebuild after `identity` was enrolled.
    pub fn enroll_trigger(&self, identity: &Identity) -> Result<Trigger, PipelineError> {
        tracing::info!(identity = %identity, "enrollment changed; scheduling re-embedding");
        self.pipeline.trigger()
    }

    /// Manual rebuild request.
    pub fn retrain(&self) -> Result<Trigger, PipelineError> {
        tracing::info!("manual re-embedding requested");
        self.pipeline.trigger()
    }

    /// Drop `identity` from the gallery and, if anyone is still enrolled,
    /// schedule a rebuild. Returns the trigger result when a rebuild was
    /// requested. Unknown identities are a no-op: no write, no rebuild.
    pub fn remove_identity(&self, identity: &Identity) -> Result<Option<Trigger>, RemoveError> {
        match self.gallery.remove(identity) {
            Ok(true) => tracing::info!(identity = %identity, "removed from gallery"),
            Ok(false) => {
                tracing::debug!(identity = %identity, "not in gallery; nothing to remove");
                return Ok(None);
            }
            // The in-memory removal took effect; only the mirror is stale.
            Err(e) => tracing::error!(identity = %identity, error = %e, "gallery removal not persisted"),
        }

        let remaining = self.source.enrolled_identities()?;
        if remaining.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.pipeline.trigger()?))
    }

    pub fn training_state(&self) -> TrainingState {
        self.pipeline.state()
    }

    pub fn gallery_size(&self) -> usize {
        self.gallery.len()
    }

    pub fn gallery(&self) -> &GalleryStore {
        &self.gallery
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RemoveError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::png_bytes;
    use crate::descriptor::DescriptorParams;
    use crate::detector::FullFrameDetector;
    use crate::gallery::{Gallery, JsonGalleryFile};
    use crate::pipeline::tests::{face_png, MemorySource};
    use crate::pipeline::RunOutcome;
    use parking_lot::Mutex;

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    fn engine(source: MemorySource) -> (tempfile::TempDir, Arc<MemorySource>, FaceEngine) {
        let dir = tempfile::tempdir().unwrap();
        let gallery = GalleryStore::open(JsonGalleryFile::new(dir.path().join("gallery.json")));
        let extractor = FeatureExtractor::new(FullFrameDetector, DescriptorParams::default());
        let source = Arc::new(source);
        let engine = FaceEngine::new(extractor, gallery, source.clone(), MatchPolicy::default());
        (dir, source, engine)
    }

    fn train(engine: &FaceEngine) {
        let report = engine.retrain().unwrap().into_handle().unwrap().wait().unwrap();
        assert_eq!(report.outcome, RunOutcome::Installed);
    }

    #[test]
    fn test_identify_empty_gallery() {
        let (_dir, _source, engine) = engine(MemorySource::default());
        let probe = engine.extract_features(&face_png(1)).unwrap();
        let result = engine.identify(&probe);
        assert_eq!(result.rejected, Some(RejectReason::GalleryEmpty));
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_identify_enrolled_face() {
        let (_dir, _source, engine) = engine(MemorySource::with(vec![("alice", Some(face_png(1)))]));
        train(&engine);

        let result = engine.identify_image(&face_png(1)).unwrap();
        assert_eq!(result.identity, Some(id("alice")));
        assert!((result.confidence - 1.0).abs() < 1e-6);
        assert_eq!(engine.gallery_size(), 1);
    }

    #[test]
    fn test_identify_image_decode_error() {
        let (_dir, _source, engine) = engine(MemorySource::default());
        assert!(matches!(engine.identify_image(b"nope"), Err(ExtractError::Decode(_))));
    }

    #[test]
    fn test_identify_image_without_face() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = GalleryStore::open(JsonGalleryFile::new(dir.path().join("gallery.json")));

        struct Blind;
        impl crate::detector::FaceDetector for Blind {
            fn detect(&self, _: &[u8], _: u32, _: u32) -> Vec<crate::types::FaceRegion> {
                Vec::new()
            }
        }

        let engine = FaceEngine::new(
            FeatureExtractor::new(Blind, DescriptorParams::default()),
            gallery,
            Arc::new(MemorySource::default()),
            MatchPolicy::default(),
        );
        let result = engine.identify_image(&png_bytes(4, 4, vec![9; 16])).unwrap();
        assert_eq!(result.rejected, Some(RejectReason::NoFace));
    }

    #[test]
    fn test_identify_reports_busy_during_rebuild() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let source = MemorySource {
            gate: Some(Arc::clone(&gate)),
            ..MemorySource::with(vec![("alice", Some(face_png(1)))])
        };
        let (_dir, _source, engine) = engine(source);
        let probe = engine.extract_features(&face_png(1)).unwrap();

        let handle = engine.enroll_trigger(&id("alice")).unwrap().into_handle().unwrap();
        assert_eq!(engine.training_state(), TrainingState::Running);
        assert_eq!(engine.identify(&probe).rejected, Some(RejectReason::PipelineBusy));

        drop(held);
        handle.wait().unwrap();
        assert_eq!(engine.training_state(), TrainingState::Idle);
        assert!(engine.identify(&probe).is_match());
    }

    #[test]
    fn test_shared_lock_busy_across_engines() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let source = MemorySource {
            gate: Some(Arc::clone(&gate)),
            ..MemorySource::with(vec![("alice", Some(face_png(1)))])
        };
        let (dir, _source, trainer) = engine(source);
        let lock_path = dir.path().join("reembed.lock");
        let trainer = trainer.with_run_lock(RunLock::new(&lock_path));

        let gallery = GalleryStore::open(JsonGalleryFile::new(dir.path().join("gallery.json")));
        let observer = FaceEngine::new(
            FeatureExtractor::new(FullFrameDetector, DescriptorParams::default()),
            gallery,
            Arc::new(MemorySource::with(vec![("alice", Some(face_png(1)))])),
            MatchPolicy::default(),
        )
        .with_run_lock(RunLock::new(&lock_path));
        let probe = observer.extract_features(&face_png(1)).unwrap();

        let handle = trainer.retrain().unwrap().into_handle().unwrap();
        assert_eq!(observer.training_state(), TrainingState::Running);
        assert_eq!(observer.identify(&probe).rejected, Some(RejectReason::PipelineBusy));
        assert!(!observer.retrain().unwrap().started());

        drop(held);
        handle.wait().unwrap();
        assert_eq!(observer.training_state(), TrainingState::Idle);
    }

    #[test]
    fn test_remove_non_enrolled_is_noop() {
        let (_dir, source, engine) = engine(MemorySource::with(vec![("alice", Some(face_png(1)))]));
        train(&engine);
        let before: Gallery = (*engine.gallery().snapshot()).clone();

        // A rebuild now would pick up the new photo and change the gallery.
        source.images.lock().insert(id("alice"), Some(face_png(9)));

        assert!(engine.remove_identity(&id("mallory")).unwrap().is_none());
        assert_eq!(engine.training_state(), TrainingState::Idle);
        assert_eq!(engine.gallery_size(), 1);
        assert_eq!(*engine.gallery().snapshot(), before);
    }

    #[test]
    fn test_remove_enrolled_retrains_remaining() {
        let (_dir, source, engine) = engine(MemorySource::with(vec![
            ("alice", Some(face_png(1))),
            ("bob", Some(face_png(7))),
        ]));
        train(&engine);
        assert_eq!(engine.gallery_size(), 2);

        source.images.lock().remove(&id("alice"));
        let trigger = engine.remove_identity(&id("alice")).unwrap().expect("bob remains enrolled");
        assert!(!engine.gallery().snapshot().contains(&id("alice")));
        trigger.into_handle().unwrap().wait().unwrap();

        let gallery = engine.gallery().snapshot();
        assert_eq!(gallery.identities().collect::<Vec<_>>(), vec![&id("bob")]);
    }

    #[test]
    fn test_remove_last_identity_skips_retrain() {
        let (_dir, source, engine) = engine(MemorySource::with(vec![("alice", Some(face_png(1)))]));
        train(&engine);

        source.images.lock().clear();
        assert!(engine.remove_identity(&id("alice")).unwrap().is_none());
        assert_eq!(engine.gallery_size(), 0);
        assert_eq!(engine.training_state(), TrainingState::Idle);
    }
}
