//! Face detection: the `FaceDetector` seam plus a multi-scale Haar cascade
//! implementation.
//!
//! The cascade scan follows the classic sliding-window scheme: the image is
//! downscaled by successive powers of the scale factor, a fixed-size window
//! is slid over each level, and overlapping hits are clustered so that only
//! regions confirmed by enough neighbors survive.

use crate::cascade::{CascadeError, HaarCascade, IntegralImage};
use crate::imgproc::resize_bilinear;
use crate::types::FaceRegion;
use std::path::{Path, PathBuf};

// --- Named constants (no magic numbers) ---
pub const DEFAULT_SCALE_FACTOR: f64 = 1.3;
pub const DEFAULT_MIN_NEIGHBORS: usize = 5;
/// Relative tolerance for clustering candidate rectangles.
const GROUP_EPS: f64 = 0.2;
/// Scan step in pixels of the downscaled image; drops to 1 past this factor.
const COARSE_STEP_MAX_FACTOR: f64 = 2.0;

const DEFAULT_CASCADE_PATH: &str = "/usr/share/opencv4/haarcascades/haarcascade_frontalface_default.xml";

/// Where the stock frontal-face cascade lives on a typical Linux install.
pub fn default_cascade_path() -> PathBuf {
    PathBuf::from(DEFAULT_CASCADE_PATH)
}

/// Pluggable face detection backend.
pub trait FaceDetector: Send + Sync {
    /// Detect faces in a row-major grayscale buffer of `width` × `height` bytes.
    ///
    /// Regions come back in the detector's own scan order; callers that want
    /// a single face take the first one.
    fn detect(&self, gray: &[u8], width: u32, height: u32) -> Vec<FaceRegion>;

    /// The most prominent face, if any. Zero detections is a normal outcome.
    fn detect_first(&self, gray: &[u8], width: u32, height: u32) -> Option<FaceRegion> {
        self.detect(gray, width, height).into_iter().next()
    }
}

/// Tuning constants for the cascade scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeParams {
    /// Ratio between successive pyramid levels. Must be > 1.
    pub scale_factor: f64,
    /// A cluster needs more than this many raw hits to be reported.
    /// Zero disables clustering.
    pub min_neighbors: usize,
}

impl Default for CascadeParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
        }
    }
}

/// Signed rectangle used during scanning and clustering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x: i32,
    y: i32,
    w: i32,
    h: i32,
}

/// Multi-scale Haar cascade face detector.
pub struct CascadeDetector {
    cascade: HaarCascade,
    params: CascadeParams,
}

impl CascadeDetector {
    pub fn new(cascade: HaarCascade, params: CascadeParams) -> Result<Self, CascadeError> {
        if !(params.scale_factor > 1.0) {
            return Err(CascadeError::Malformed(format!(
                "scale factor must be > 1, got {}",
                params.scale_factor
            )));
        }
        Ok(Self { cascade, params })
    }

    /// Load the cascade XML at `path` and build a detector around it.
    pub fn load(path: impl AsRef<Path>, params: CascadeParams) -> Result<Self, CascadeError> {
        Self::new(HaarCascade::load(path)?, params)
    }

    /// Every window accepted by the cascade, smallest scale first.
    fn candidates(&self, gray: &[u8], width: usize, height: usize) -> Vec<Rect> {
        let (win_w, win_h) = self.cascade.window_size();
        let mut hits = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let scaled_w = (width as f64 / factor).round() as usize;
            let scaled_h = (height as f64 / factor).round() as usize;
            if scaled_w < win_w || scaled_h < win_h {
                break;
            }

            let orig_w = (win_w as f64 * factor).round() as i32;
            let orig_h = (win_h as f64 * factor).round() as i32;
            if orig_w as usize > width || orig_h as usize > height {
                break;
            }

            let level;
            let pixels = if scaled_w == width && scaled_h == height {
                gray
            } else {
                level = resize_bilinear(gray, width, height, scaled_w, scaled_h);
                &level[..]
            };
            let ii = IntegralImage::new(pixels, scaled_w, scaled_h);
            let step = if factor > COARSE_STEP_MAX_FACTOR { 1 } else { 2 };

            let before = hits.len();
            for y in (0..=scaled_h - win_h).step_by(step) {
                for x in (0..=scaled_w - win_w).step_by(step) {
                    if self.cascade.classify(&ii, x, y) {
                        hits.push(Rect {
                            x: (x as f64 * factor).round() as i32,
                            y: (y as f64 * factor).round() as i32,
                            w: orig_w,
                            h: orig_h,
                        });
                    }
                }
            }
            tracing::trace!(factor, level = ?(scaled_w, scaled_h), hits = hits.len() - before, "cascade level scanned");

            factor *= self.params.scale_factor;
        }

        hits
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, gray: &[u8], width: u32, height: u32) -> Vec<FaceRegion> {
        let (w, h) = (width as usize, height as usize);
        if gray.len() < w * h {
            tracing::warn!(len = gray.len(), width, height, "frame buffer shorter than dimensions");
            return Vec::new();
        }

        let raw = self.candidates(gray, w, h);
        let grouped = group_rectangles(raw, self.params.min_neighbors, GROUP_EPS);

        grouped
            .into_iter()
            .filter_map(|r| FaceRegion::clipped(r.x, r.y, r.w, r.h, width, height))
            .collect()
    }
}

/// Treats the whole frame as the face. For inputs that are already cropped
/// to a single face.
#[derive(Debug, Default, Clone, Copy)]
pub struct FullFrameDetector;

impl FaceDetector for FullFrameDetector {
    fn detect(&self, _gray: &[u8], width: u32, height: u32) -> Vec<FaceRegion> {
        FaceRegion::clipped(0, 0, width as i32, height as i32, width, height)
            .into_iter()
            .collect()
    }
}

fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.w.min(b.w) + a.h.min(b.h)) as f64 * 0.5;
    ((a.x - b.x).abs() as f64) <= delta
        && ((a.y - b.y).abs() as f64) <= delta
        && ((a.x + a.w - b.x - b.w).abs() as f64) <= delta
        && ((a.y + a.h - b.y - b.h).abs() as f64) <= delta
}

/// Cluster overlapping hits and keep clusters with more than `min_neighbors`
/// members, averaged into one rectangle each. Clusters nested inside a
/// stronger cluster are dropped. Output follows first-hit order.
fn group_rectangles(rects: Vec<Rect>, min_neighbors: usize, eps: f64) -> Vec<Rect> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects;
    }

    // Union-find partition by the similarity predicate.
    let mut parent: Vec<usize> = (0..rects.len()).collect();
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }
    for i in 0..rects.len() {
        for j in 0..i {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[ri] = rj;
                }
            }
        }
    }

    // Label clusters in order of first appearance.
    let mut label_of_root: Vec<Option<usize>> = vec![None; rects.len()];
    let mut sums: Vec<(i64, i64, i64, i64)> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();
    for (i, r) in rects.iter().enumerate() {
        let root = find(&mut parent, i);
        let label = match label_of_root[root] {
            Some(l) => l,
            None => {
                let l = sums.len();
                label_of_root[root] = Some(l);
                sums.push((0, 0, 0, 0));
                counts.push(0);
                l
            }
        };
        let s = &mut sums[label];
        s.0 += r.x as i64;
        s.1 += r.y as i64;
        s.2 += r.w as i64;
        s.3 += r.h as i64;
        counts[label] += 1;
    }

    let averaged: Vec<Rect> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let inv = 1.0 / n as f64;
            Rect {
                x: (s.0 as f64 * inv).round() as i32,
                y: (s.1 as f64 * inv).round() as i32,
                w: (s.2 as f64 * inv).round() as i32,
                h: (s.3 as f64 * inv).round() as i32,
            }
        })
        .collect();

    let mut kept = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= min_neighbors {
            continue;
        }

        let nested = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if j == i || n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.w as f64 * eps).round() as i32;
            let dy = (r2.h as f64 * eps).round() as i32;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.w <= r2.x + r2.w + dx
                && r1.y + r1.h <= r2.y + r2.h + dy
                && (n2 > n1.max(3) || n1 < 3)
        });

        if !nested {
            kept.push(*r1);
        }
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::tests::STEP_CASCADE;

    fn rect(x: i32, y: i32, w: i32, h: i32) -> Rect {
        Rect { x, y, w, h }
    }

    fn step_detector(min_neighbors: usize) -> CascadeDetector {
        let cascade = HaarCascade::from_xml(STEP_CASCADE).unwrap();
        CascadeDetector::new(cascade, CascadeParams { scale_factor: 1.3, min_neighbors }).unwrap()
    }

    #[test]
    fn test_default_params() {
        let p = CascadeParams::default();
        assert!((p.scale_factor - 1.3).abs() < 1e-12);
        assert_eq!(p.min_neighbors, 5);
    }

    #[test]
    fn test_scale_factor_must_exceed_one() {
        let cascade = HaarCascade::from_xml(STEP_CASCADE).unwrap();
        let params = CascadeParams { scale_factor: 1.0, min_neighbors: 5 };
        assert!(CascadeDetector::new(cascade, params).is_err());
    }

    #[test]
    fn test_candidates_on_step_image() {
        // 12x12: rows 0-5 dark, rows 6-11 bright.
        let gray: Vec<u8> = (0..144).map(|i| if i / 12 < 6 { 0 } else { 200 }).collect();
        let detector = step_detector(0);
        let hits = detector.candidates(&gray, 12, 12);

        let base: Vec<&Rect> = hits.iter().filter(|r| r.w == 6).collect();
        assert!(base.iter().any(|r| r.y == 2));
        assert!(base.iter().any(|r| r.y == 4));
        // Windows entirely inside one half are flat and rejected.
        assert!(base.iter().all(|r| r.y != 0 && r.y != 6), "{base:?}");
    }

    #[test]
    fn test_uniform_image_has_no_faces() {
        let gray = vec![90u8; 40 * 40];
        assert!(step_detector(0).detect(&gray, 40, 40).is_empty());
    }

    #[test]
    fn test_detect_ignores_short_buffer() {
        let gray = vec![0u8; 10];
        assert!(step_detector(0).detect(&gray, 40, 40).is_empty());
    }

    #[test]
    fn test_detected_regions_inside_image() {
        let gray: Vec<u8> = (0..(30 * 30)).map(|i| if i / 30 < 15 { 10 } else { 230 }).collect();
        for region in step_detector(0).detect(&gray, 30, 30) {
            assert!(region.width > 0 && region.height > 0);
            assert!(region.x + region.width <= 30);
            assert!(region.y + region.height <= 30);
        }
    }

    #[test]
    fn test_group_rectangles_needs_enough_neighbors() {
        let cluster: Vec<Rect> = (0..6).map(|i| rect(100 + i, 100, 50, 50)).collect();
        let lonely = rect(300, 300, 50, 50);

        let mut rects = cluster.clone();
        rects.push(lonely);

        let grouped = group_rectangles(rects, 5, GROUP_EPS);
        assert_eq!(grouped.len(), 1);
        // Average of x = 100..=105 is 102.5 → rounds to 103 (half away from zero).
        assert_eq!(grouped[0], rect(103, 100, 50, 50));

        // Exactly min_neighbors hits is not enough.
        let five: Vec<Rect> = (0..5).map(|i| rect(100 + i, 100, 50, 50)).collect();
        assert!(group_rectangles(five, 5, GROUP_EPS).is_empty());
    }

    #[test]
    fn test_group_rectangles_drops_nested_weaker_cluster() {
        let mut rects: Vec<Rect> = (0..10).map(|i| rect(100 + i % 2, 100, 100, 100)).collect();
        rects.extend((0..6).map(|_| rect(130, 130, 30, 30)));

        let grouped = group_rectangles(rects, 5, GROUP_EPS);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].w, 100);
    }

    #[test]
    fn test_group_rectangles_keeps_first_hit_order() {
        let mut rects: Vec<Rect> = (0..6).map(|_| rect(400, 0, 40, 40)).collect();
        rects.extend((0..8).map(|_| rect(0, 0, 40, 40)));

        let grouped = group_rectangles(rects, 5, GROUP_EPS);
        assert_eq!(grouped, vec![rect(400, 0, 40, 40), rect(0, 0, 40, 40)]);
    }

    #[test]
    fn test_group_rectangles_disabled() {
        let rects = vec![rect(0, 0, 10, 10)];
        assert_eq!(group_rectangles(rects.clone(), 0, GROUP_EPS), rects);
    }

    #[test]
    fn test_full_frame_detector() {
        let regions = FullFrameDetector.detect(&[0u8; 12], 4, 3);
        assert_eq!(regions, vec![FaceRegion { x: 0, y: 0, width: 4, height: 3 }]);
        assert!(FullFrameDetector.detect_first(&[], 0, 0).is_none());
    }
}
