//! Feature distillation: deduplication of boundary-straddling detections.
//!
//! Tiles are cut with an overlap so that objects on a tile edge are fully
//! visible
//! in at least one tile, which means the same object is routinely detected
//! twice. After lifting into the full-image frame, overlapping duplicates
//! are resolved per class by non-maximal suppression, either the classic
//! greedy drop (NMS) or gaussian score decay (Soft-NMS).
//!
//! Selection is deterministic: equal scores tie-break on bbox min-x, then
//! min-y, then input order, and the surviving features are returned in input
//! order.

use crate::feature::Feature;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Deduplication algorithm applied to a region's features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistillationMode {
    /// Pass features through unchanged.
    #[serde(rename = "NONE")]
    None,
    /// Greedy non-maximal suppression.
    #[serde(rename = "NMS")]
    #[default]
    Nms,
    /// Gaussian Soft-NMS: decay overlapping scores instead of dropping.
    #[serde(rename = "SOFT-NMS")]
    SoftNms,
}

/// Tuning for the distillation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistillationOptions {
    pub mode: DistillationMode,
    /// Candidates whose IoU with a selected feature exceeds this are
    /// suppressed (NMS only).
    pub iou_threshold: f64,
    /// Gaussian decay width for Soft-NMS.
    pub sigma: f64,
    /// Soft-NMS drops features once their decayed score falls below this.
    pub score_floor: f64,
}

impl Default for DistillationOptions {
    fn default() -> Self {
        Self {
            mode: DistillationMode::default(),
            iou_threshold: 0.5,
            sigma: 0.5,
            score_floor: 0.001,
        }
    }
}

impl DistillationOptions {
    pub fn with_mode(mode: DistillationMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// Intersection-over-union of two `[min_x, min_y, max_x, max_y]` boxes.
///
/// Coincident boxes have IoU 1.0 even when degenerate (a Point feature's
/// bbox has zero area but is still a perfect duplicate of itself).
pub fn iou(a: [f64; 4], b: [f64; 4]) -> f64 {
    if a == b {
        return 1.0;
    }
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = ix * iy;
    if intersection <= 0.0 {
        return 0.0;
    }
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

struct Candidate {
    /// Position in the input, for deterministic ties and output ordering.
    index: usize,
    bbox: [f64; 4],
    /// Current (possibly decayed) dominant-class score.
    score: f64,
    /// The model's original score.
    raw_score: f64,
    feature: Feature,
}

fn candidate_order(a: &Candidate, b: &Candidate) -> std::cmp::Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.bbox[0].total_cmp(&b.bbox[0]))
        .then(a.bbox[1].total_cmp(&b.bbox[1]))
        .then(a.index.cmp(&b.index))
}

/// Applies the configured distillation algorithm to a region's features.
pub struct FeatureSelector {
    options: DistillationOptions,
}

impl FeatureSelector {
    pub fn new(options: DistillationOptions) -> Self {
        Self { options }
    }

    /// Deduplicates `features`, returning survivors in input order.
    ///
    /// Features without a dominant class are grouped together; features
    /// without pixel bounds cannot participate in IoU and pass through
    /// untouched.
    pub fn select(&self, features: Vec<Feature>) -> Vec<Feature> {
        if features.is_empty() || self.options.mode == DistillationMode::None {
            return features;
        }
        let input_count = features.len();

        // Partition into per-class candidate groups, preserving input index.
        let mut groups: Vec<(String, Vec<Candidate>)> = Vec::new();
        let mut passthrough: Vec<(usize, Feature)> = Vec::new();
        for (index, feature) in features.into_iter().enumerate() {
            let Some(bbox) = feature.image_bounds() else {
                passthrough.push((index, feature));
                continue;
            };
            let (class, score) = match feature.dominant_class() {
                Some(class) => (class.iri.clone(), class.score),
                None => (String::new(), 1.0),
            };
            let candidate = Candidate {
                index,
                bbox,
                score,
                raw_score: score,
                feature,
            };
            match groups.iter_mut().find(|(iri, _)| *iri == class) {
                Some((_, members)) => members.push(candidate),
                None => groups.push((class, vec![candidate])),
            }
        }

        let mut survivors: Vec<(usize, Feature)> = passthrough;
        for (class, members) in groups {
            let kept = match self.options.mode {
                DistillationMode::None => unreachable!("handled above"),
                DistillationMode::Nms => self.suppress(members),
                DistillationMode::SoftNms => self.decay(members),
            };
            for mut candidate in kept {
                if self.options.mode == DistillationMode::SoftNms {
                    apply_adjusted_score(&mut candidate.feature, &class, candidate.score, candidate.raw_score);
                }
                survivors.push((candidate.index, candidate.feature));
            }
        }

        survivors.sort_by_key(|(index, _)| *index);
        debug!(
            input = input_count,
            output = survivors.len(),
            mode = ?self.options.mode,
            "Feature distillation complete"
        );
        survivors.into_iter().map(|(_, feature)| feature).collect()
    }

    /// Classic greedy NMS within one class group.
    fn suppress(&self, mut remaining: Vec<Candidate>) -> Vec<Candidate> {
        remaining.sort_by(candidate_order);
        let mut kept = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let top = remaining.remove(0);
            remaining.retain(|candidate| iou(top.bbox, candidate.bbox) <= self.options.iou_threshold);
            kept.push(top);
        }
        kept
    }

    /// Gaussian Soft-NMS within one class group.
    fn decay(&self, mut remaining: Vec<Candidate>) -> Vec<Candidate> {
        let mut kept = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            remaining.sort_by(candidate_order);
            let top = remaining.remove(0);
            for candidate in &mut remaining {
                let overlap = iou(top.bbox, candidate.bbox);
                if overlap > 0.0 {
                    candidate.score *= (-overlap * overlap / self.options.sigma).exp();
                }
            }
            remaining.retain(|candidate| candidate.score >= self.options.score_floor);
            kept.push(top);
        }
        kept
    }
}

/// Writes a Soft-NMS adjusted score back onto the dominant class entry,
/// preserving the model's original score as `rawScore`.
fn apply_adjusted_score(feature: &mut Feature, class: &str, score: f64, raw_score: f64) {
    if let Some(entry) = feature
        .properties
        .feature_classes
        .iter_mut()
        .find(|entry| entry.iri == class)
    {
        entry.score = score;
        entry.raw_score = Some(raw_score);
    }
}
