//! Probe-vs-gallery matching with an ambiguity-gap guard.

use crate::gallery::Gallery;
use crate::types::{FeatureVector, Identity, MatchResult, RejectReason};

// --- Named constants (no magic numbers) ---
/// Above this best score the ambiguity-gap rule is skipped.
pub const AMBIGUITY_CUTOFF: f32 = 0.90;
/// Minimum lead of the best score over the runner-up below the cutoff.
pub const AMBIGUITY_MARGIN: f32 = 0.03;
/// Default operational acceptance threshold.
pub const ACCEPT_THRESHOLD: f32 = 0.65;

/// Decision knobs for identification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    pub ambiguity_cutoff: f32,
    pub ambiguity_margin: f32,
    /// Best scores under this are reported as `below_threshold`.
    pub accept_threshold: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            ambiguity_cutoff: AMBIGUITY_CUTOFF,
            ambiguity_margin: AMBIGUITY_MARGIN,
            accept_threshold: ACCEPT_THRESHOLD,
        }
    }
}

/// Strategy for comparing a probe vector against the enrolled gallery.
pub trait Matcher {
    fn compare(&self, probe: &FeatureVector, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Cosine similarity matcher.
///
/// Scores every gallery entry (linear scan, no early exit), keeps the first
/// strictly-best identity in gallery order, then applies the ambiguity-gap
/// rule and the caller's acceptance threshold.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    pub ambiguity_cutoff: f32,
    pub ambiguity_margin: f32,
}

impl CosineMatcher {
    pub fn from_policy(policy: &MatchPolicy) -> Self {
        Self {
            ambiguity_cutoff: policy.ambiguity_cutoff,
            ambiguity_margin: policy.ambiguity_margin,
        }
    }
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self::from_policy(&MatchPolicy::default())
    }
}

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &FeatureVector, gallery: &Gallery, threshold: f32) -> MatchResult {
        if gallery.is_empty() {
            return MatchResult::rejected(RejectReason::GalleryEmpty, 0.0);
        }

        let mut best_sim = 0.0f32;
        let mut best: Option<&Identity> = None;
        let mut scores = Vec::with_capacity(gallery.len());

        for (identity, vector) in gallery.iter() {
            let sim = probe.similarity(vector);
            scores.push(sim);
            if sim > best_sim {
                best_sim = sim;
                best = Some(identity);
            }
        }

        if scores.len() > 1 && best_sim < self.ambiguity_cutoff {
            scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
            let (top, second) = (scores[0], scores[1]);
            let gap = top - second;
            if gap < self.ambiguity_margin {
                tracing::info!(top, second, gap, "ambiguous match");
                return MatchResult::rejected(RejectReason::Ambiguous, top);
            }
        }

        match best {
            Some(identity) if best_sim >= threshold => {
                tracing::info!(identity = %identity, similarity = best_sim, "best match");
                MatchResult::accepted(identity.clone(), best_sim)
            }
            _ => {
                tracing::debug!(similarity = best_sim, threshold, "best match below threshold");
                MatchResult::rejected(RejectReason::BelowThreshold, best_sim)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    fn fv(values: &[f32]) -> FeatureVector {
        FeatureVector::from_values(values.to_vec())
    }

    /// Unit vector whose cosine with the probe `[1, 0, 0]` is `score`, using
    /// `axis` (1 or 2) for the orthogonal component.
    fn scoring(score: f32, axis: usize) -> FeatureVector {
        let mut v = vec![score, 0.0, 0.0];
        v[axis] = (1.0 - score * score).sqrt();
        FeatureVector::from_values(v)
    }

    fn probe() -> FeatureVector {
        fv(&[1.0, 0.0, 0.0])
    }

    #[test]
    fn test_default_policy() {
        let p = MatchPolicy::default();
        assert_eq!(p.ambiguity_cutoff, 0.90);
        assert_eq!(p.ambiguity_margin, 0.03);
        assert_eq!(p.accept_threshold, 0.65);
    }

    #[test]
    fn test_empty_gallery() {
        let result = CosineMatcher::default().compare(&probe(), &Gallery::new(), ACCEPT_THRESHOLD);
        assert_eq!(result, MatchResult::rejected(RejectReason::GalleryEmpty, 0.0));
    }

    #[test]
    fn test_identical_single_entry() {
        let v = FeatureVector::normalized(vec![3.0, 1.0, 4.0, 1.0, 5.0]);
        let gallery: Gallery = [(id("alice"), v.clone())].into_iter().collect();

        let result = CosineMatcher::default().compare(&v, &gallery, ACCEPT_THRESHOLD);
        assert!(result.is_match());
        assert_eq!(result.identity, Some(id("alice")));
        assert!((result.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_high_confidence_skips_ambiguity_rule() {
        let gallery: Gallery = [(id("alice"), scoring(0.92, 1)), (id("bob"), scoring(0.80, 2))]
            .into_iter()
            .collect();

        let result = CosineMatcher::default().compare(&probe(), &gallery, ACCEPT_THRESHOLD);
        assert_eq!(result.identity, Some(id("alice")));
        assert!((result.confidence - 0.92).abs() < 1e-6);
    }

    #[test]
    fn test_near_tie_is_ambiguous() {
        let gallery: Gallery = [(id("alice"), scoring(0.70, 1)), (id("bob"), scoring(0.69, 2))]
            .into_iter()
            .collect();

        let result = CosineMatcher::default().compare(&probe(), &gallery, ACCEPT_THRESHOLD);
        assert_eq!(result.identity, None);
        assert_eq!(result.rejected, Some(RejectReason::Ambiguous));
        assert!((result.confidence - 0.70).abs() < 1e-6);
    }

    #[test]
    fn test_near_tie_above_cutoff_accepted() {
        let gallery: Gallery = [(id("alice"), scoring(0.95, 1)), (id("bob"), scoring(0.94, 2))]
            .into_iter()
            .collect();

        let result = CosineMatcher::default().compare(&probe(), &gallery, ACCEPT_THRESHOLD);
        assert_eq!(result.identity, Some(id("alice")));
    }

    #[test]
    fn test_clear_gap_accepted() {
        let gallery: Gallery = [(id("alice"), scoring(0.60, 1)), (id("bob"), scoring(0.80, 2))]
            .into_iter()
            .collect();

        let result = CosineMatcher::default().compare(&probe(), &gallery, ACCEPT_THRESHOLD);
        assert_eq!(result.identity, Some(id("bob")));
        assert!((result.confidence - 0.80).abs() < 1e-6);
    }

    #[test]
    fn test_below_threshold() {
        let gallery: Gallery = [(id("alice"), scoring(0.50, 1))].into_iter().collect();

        let result = CosineMatcher::default().compare(&probe(), &gallery, ACCEPT_THRESHOLD);
        assert_eq!(result.identity, None);
        assert_eq!(result.rejected, Some(RejectReason::BelowThreshold));
        assert!((result.confidence - 0.50).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_callers_knob() {
        let gallery: Gallery = [(id("alice"), scoring(0.50, 1))].into_iter().collect();
        let result = CosineMatcher::default().compare(&probe(), &gallery, 0.4);
        assert_eq!(result.identity, Some(id("alice")));
    }

    #[test]
    fn test_scans_entire_gallery() {
        // Best match sorts last.
        let gallery: Gallery = [
            (id("a_decoy"), fv(&[0.0, 1.0, 0.0])),
            (id("b_decoy"), fv(&[0.0, 0.0, 1.0])),
            (id("z_match"), fv(&[1.0, 0.0, 0.0])),
        ]
        .into_iter()
        .collect();

        let result = CosineMatcher::default().compare(&probe(), &gallery, ACCEPT_THRESHOLD);
        assert_eq!(result.identity, Some(id("z_match")));
    }

    #[test]
    fn test_no_positive_similarity() {
        let gallery: Gallery = [(id("alice"), fv(&[-1.0, 0.0, 0.0]))].into_iter().collect();
        let result = CosineMatcher::default().compare(&probe(), &gallery, 0.0);
        assert_eq!(result.rejected, Some(RejectReason::BelowThreshold));
        assert_eq!(result.confidence, 0.0);
    }
}
