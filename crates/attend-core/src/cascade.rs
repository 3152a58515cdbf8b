//! Haar cascade classifier in OpenCV's XML cascade format.
//!
//! Loads boosted stage classifiers of Haar-like features (e.g. the stock
//! `haarcascade_frontalface_default.xml`) and evaluates them on detection
//! windows through integral images.

use roxmltree::{Document, Node};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Slack under each stage threshold; matches OpenCV's `THRESHOLD_EPS`.
pub const STAGE_THRESHOLD_EPS: f64 = 1e-5;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0} (install OpenCV data files or set ATTEND_CASCADE_PATH)")]
    NotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("cascade XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("malformed cascade: {0}")]
    Malformed(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
}

/// One rectangle of a Haar-like feature, in window coordinates.
#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    weight: f32,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

#[derive(Debug, Clone, Copy)]
struct TreeNode {
    /// Child indices; values <= 0 refer to leaf `-index`.
    left: i32,
    right: i32,
    feature: usize,
    threshold: f32,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<TreeNode>,
    leaves: Vec<f32>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f32,
    classifiers: Vec<WeakClassifier>,
}

/// A loaded boosted Haar cascade.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: usize,
    window_height: usize,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Load a cascade from an OpenCV XML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }

        let xml = std::fs::read_to_string(path)?;
        let cascade = Self::from_xml(&xml)?;

        tracing::info!(
            path = %path.display(),
            window = ?(cascade.window_width, cascade.window_height),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse a cascade from OpenCV XML text.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let doc = Document::parse(xml)?;
        let cascade = doc
            .root_element()
            .children()
            .find(|n| n.is_element())
            .ok_or_else(|| malformed("no cascade element under root"))?;

        let stage_type = text(child(cascade, "stageType")?);
        if stage_type != "BOOST" {
            return Err(CascadeError::Unsupported(format!("stage type {stage_type}")));
        }
        let feature_type = text(child(cascade, "featureType")?);
        if feature_type != "HAAR" {
            return Err(CascadeError::Unsupported(format!("feature type {feature_type}")));
        }

        let window_width: usize = scalar(child(cascade, "width")?)?;
        let window_height: usize = scalar(child(cascade, "height")?)?;
        if window_width < 3 || window_height < 3 {
            return Err(malformed("detection window must be at least 3x3"));
        }

        let features = items(child(cascade, "features")?)
            .map(|f| parse_feature(f, window_width, window_height))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = items(child(cascade, "stages")?)
            .map(|s| parse_stage(s, features.len()))
            .collect::<Result<Vec<_>, _>>()?;

        if stages.is_empty() {
            return Err(malformed("cascade has no stages"));
        }

        Ok(Self {
            window_width,
            window_height,
            stages,
            features,
        })
    }

    /// Detection window size (width, height) the cascade was trained on.
    pub fn window_size(&self) -> (usize, usize) {
        (self.window_width, self.window_height)
    }

    /// Run every stage on the window whose top-left corner is `(x, y)`.
    ///
    /// Feature responses are divided by the window's intensity spread
    /// (standard deviation × area over the window interior) so the cascade
    /// is insensitive to lighting gain.
    pub(crate) fn classify(&self, ii: &IntegralImage, x: usize, y: usize) -> bool {
        let (nx, ny) = (x + 1, y + 1);
        let (nw, nh) = (self.window_width - 2, self.window_height - 2);
        let area = (nw * nh) as f64;
        let sum = ii.sum(nx, ny, nw, nh) as f64;
        let sqsum = ii.sqsum(nx, ny, nw, nh);

        let spread = area * sqsum - sum * sum;
        let norm = if spread > 0.0 { spread.sqrt() } else { 1.0 };

        for stage in &self.stages {
            let mut score = 0.0f64;
            for classifier in &stage.classifiers {
                score += classifier.evaluate(|f| self.features[f].response(ii, x, y) / norm) as f64;
            }
            if score < stage.threshold as f64 - STAGE_THRESHOLD_EPS {
                return false;
            }
        }
        true
    }
}

impl WeakClassifier {
    fn evaluate(&self, response: impl Fn(usize) -> f64) -> f32 {
        let mut idx: i32 = 0;
        loop {
            let node = &self.nodes[idx as usize];
            idx = if response(node.feature) < node.threshold as f64 {
                node.left
            } else {
                node.right
            };
            if idx <= 0 {
                break;
            }
        }
        self.leaves[(-idx) as usize]
    }
}

impl HaarFeature {
    fn response(&self, ii: &IntegralImage, x: usize, y: usize) -> f64 {
        self.rects
            .iter()
            .map(|r| r.weight as f64 * ii.sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

/// Summed-area tables of pixel values and squared pixel values.
pub(crate) struct IntegralImage {
    stride: usize,
    sum: Vec<i64>,
    sqsum: Vec<f64>,
}

impl IntegralImage {
    pub(crate) fn new(gray: &[u8], width: usize, height: usize) -> Self {
        let stride = width + 1;
        let mut sum = vec![0i64; stride * (height + 1)];
        let mut sqsum = vec![0f64; stride * (height + 1)];

        for y in 0..height {
            let mut row_sum = 0i64;
            let mut row_sq = 0f64;
            for x in 0..width {
                let p = gray[y * width + x] as i64;
                row_sum += p;
                row_sq += (p * p) as f64;
                let i = (y + 1) * stride + x + 1;
                sum[i] = sum[i - stride] + row_sum;
                sqsum[i] = sqsum[i - stride] + row_sq;
            }
        }

        Self { stride, sum, sqsum }
    }

    pub(crate) fn sum(&self, x: usize, y: usize, w: usize, h: usize) -> i64 {
        let s = self.stride;
        self.sum[(y + h) * s + x + w] - self.sum[y * s + x + w] - self.sum[(y + h) * s + x] + self.sum[y * s + x]
    }

    pub(crate) fn sqsum(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        let s = self.stride;
        self.sqsum[(y + h) * s + x + w] - self.sqsum[y * s + x + w] - self.sqsum[(y + h) * s + x]
            + self.sqsum[y * s + x]
    }
}

fn parse_feature(node: Node, window_width: usize, window_height: usize) -> Result<HaarFeature, CascadeError> {
    if let Ok(tilted) = child(node, "tilted") {
        if text(tilted) != "0" {
            return Err(CascadeError::Unsupported("tilted Haar features".into()));
        }
    }

    let rects = items(child(node, "rects")?)
        .map(|r| {
            let v: Vec<f32> = numbers(text(r))?;
            if v.len() != 5 {
                return Err(malformed(format!("feature rect needs 5 values, got {}", v.len())));
            }
            if v[..4].iter().any(|&c| c < 0.0) {
                return Err(malformed("negative feature rect coordinate"));
            }
            let rect = WeightedRect {
                x: v[0] as usize,
                y: v[1] as usize,
                width: v[2] as usize,
                height: v[3] as usize,
                weight: v[4],
            };
            if rect.x + rect.width > window_width || rect.y + rect.height > window_height {
                return Err(malformed("feature rect exceeds detection window"));
            }
            Ok(rect)
        })
        .collect::<Result<Vec<_>, _>>()?;

    if rects.is_empty() {
        return Err(malformed("feature without rects"));
    }
    Ok(HaarFeature { rects })
}

fn parse_stage(node: Node, feature_count: usize) -> Result<Stage, CascadeError> {
    let threshold: f32 = scalar(child(node, "stageThreshold")?)?;

    let classifiers = items(child(node, "weakClassifiers")?)
        .map(|wc| {
            let raw: Vec<f64> = numbers(text(child(wc, "internalNodes")?))?;
            let leaves: Vec<f32> = numbers(text(child(wc, "leafValues")?))?;
            if raw.is_empty() || raw.len() % 4 != 0 {
                return Err(malformed("internalNodes must hold groups of 4 values"));
            }

            let nodes: Vec<TreeNode> = raw
                .chunks_exact(4)
                .map(|c| TreeNode {
                    left: c[0] as i32,
                    right: c[1] as i32,
                    feature: c[2] as usize,
                    threshold: c[3] as f32,
                })
                .collect();

            for n in &nodes {
                if n.feature >= feature_count {
                    return Err(malformed(format!("feature index {} out of range", n.feature)));
                }
                for next in [n.left, n.right] {
                    let ok = if next > 0 {
                        (next as usize) < nodes.len()
                    } else {
                        ((-next) as usize) < leaves.len()
                    };
                    if !ok {
                        return Err(malformed(format!("tree reference {next} out of range")));
                    }
                }
            }

            Ok(WeakClassifier { nodes, leaves })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Stage { threshold, classifiers })
}

fn malformed(msg: impl Into<String>) -> CascadeError {
    CascadeError::Malformed(msg.into())
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Result<Node<'a, 'i>, CascadeError> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .ok_or_else(|| malformed(format!("missing <{name}>")))
}

/// List elements (`<_>`) under `node`.
fn items<'a, 'i: 'a>(node: Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> {
    node.children().filter(|n| n.has_tag_name("_"))
}

fn text<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

fn scalar<T: FromStr>(node: Node) -> Result<T, CascadeError> {
    let t = text(node);
    t.parse()
        .map_err(|_| malformed(format!("bad value {t:?} in <{}>", node.tag_name().name())))
}

fn numbers<T: FromStr>(t: &str) -> Result<Vec<T>, CascadeError> {
    t.split_whitespace()
        .map(|v| v.parse().map_err(|_| malformed(format!("bad number {v:?}"))))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 6×6 single-stump cascade that fires when the lower half of the
    /// window is brighter than the upper half.
    pub(crate) const STEP_CASCADE: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier">
  <stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>6</height>
  <width>6</width>
  <stageParams>
    <maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <!-- stage 0 -->
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 1.0000000149011612e-01</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 6 6 -1.</_>
        <_>
          0 3 6 3 2.</_></rects></_></features></cascade>
</opencv_storage>
"#;

    fn step_image(width: usize, height: usize, split: usize) -> Vec<u8> {
        (0..width * height)
            .map(|i| if i / width < split { 0 } else { 200 })
            .collect()
    }

    #[test]
    fn test_parse_step_cascade() {
        let cascade = HaarCascade::from_xml(STEP_CASCADE).unwrap();
        assert_eq!(cascade.window_size(), (6, 6));
        assert_eq!(cascade.stages.len(), 1);
        assert_eq!(cascade.features.len(), 1);
        assert_eq!(cascade.features[0].rects.len(), 2);
    }

    #[test]
    fn test_integral_image_sums() {
        // 3x2 image: [1 2 3; 4 5 6]
        let gray = vec![1u8, 2, 3, 4, 5, 6];
        let ii = IntegralImage::new(&gray, 3, 2);
        assert_eq!(ii.sum(0, 0, 3, 2), 21);
        assert_eq!(ii.sum(1, 0, 2, 2), 16);
        assert_eq!(ii.sum(2, 1, 1, 1), 6);
        assert!((ii.sqsum(0, 0, 2, 1) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_classify_step_window() {
        let cascade = HaarCascade::from_xml(STEP_CASCADE).unwrap();
        let gray = step_image(6, 6, 3);
        let ii = IntegralImage::new(&gray, 6, 6);
        assert!(cascade.classify(&ii, 0, 0));
    }

    #[test]
    fn test_classify_rejects_uniform_and_inverted_windows() {
        let cascade = HaarCascade::from_xml(STEP_CASCADE).unwrap();

        let flat = vec![120u8; 36];
        assert!(!cascade.classify(&IntegralImage::new(&flat, 6, 6), 0, 0));

        // Bright top, dark bottom: response is negative.
        let inverted: Vec<u8> = step_image(6, 6, 3).into_iter().map(|p| 200 - p).collect();
        assert!(!cascade.classify(&IntegralImage::new(&inverted, 6, 6), 0, 0));
    }

    #[test]
    fn test_stage_threshold_slack() {
        let gray = step_image(6, 6, 3);
        let ii = IntegralImage::new(&gray, 6, 6);

        // Stage sum is exactly 1.0 for a firing window.
        let borderline = STEP_CASCADE.replace("<stageThreshold>0.", "<stageThreshold>1.000005");
        assert!(HaarCascade::from_xml(&borderline).unwrap().classify(&ii, 0, 0));

        let above = STEP_CASCADE.replace("<stageThreshold>0.", "<stageThreshold>1.00002");
        assert!(!HaarCascade::from_xml(&above).unwrap().classify(&ii, 0, 0));
    }

    #[test]
    fn test_tilted_features_unsupported() {
        let xml = STEP_CASCADE.replace("<rects>", "<tilted>1</tilted><rects>");
        assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Unsupported(_))));
    }

    #[test]
    fn test_feature_index_out_of_range() {
        let xml = STEP_CASCADE.replace("0 -1 0 1.0000000149011612e-01", "0 -1 3 0.1");
        assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Malformed(_))));
    }

    #[test]
    fn test_missing_stages_is_malformed() {
        let start = STEP_CASCADE.find("<stages>").unwrap();
        let end = STEP_CASCADE.find("</stages>").unwrap() + "</stages>".len();
        let xml = format!("{}{}", &STEP_CASCADE[..start], &STEP_CASCADE[end..]);
        assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Malformed(_))));
    }

    #[test]
    fn test_lbp_cascade_unsupported() {
        let xml = STEP_CASCADE.replace("<featureType>HAAR", "<featureType>LBP");
        assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Unsupported(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let err = HaarCascade::load("/nonexistent/cascade.xml").unwrap_err();
        assert!(matches!(err, CascadeError::NotFound(_)));
    }
}
