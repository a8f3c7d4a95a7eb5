//! Combination of vector and full-text rankings into one relevance order.

use rustc_hash::FxHashMap;

use crate::config::{FusionConfig, FusionMode};
use crate::storage::{TextHit, VectorHit};

/// One document after fusion.
#[derive(Clone, Debug, PartialEq)]
pub struct FusedHit {
    /// Document key.
    pub key: String,
    /// Fused score, higher is better.
    pub score: f64,
    /// 1-based rank in the vector list.
    pub vector_rank: Option<usize>,
    /// 1-based rank in the full-text list.
    pub text_rank: Option<usize>,
}

struct Entry {
    key: String,
    vector: Option<(usize, f64)>,
    text: Option<(usize, f64)>,
}

/// Union of both lists: vector hits in rank order, then text-only hits in
/// rank order.
fn merge(vector: &[VectorHit], text: &[TextHit]) -> Vec<Entry> {
    let mut entries: Vec<Entry> = Vec::with_capacity(vector.len() + text.len());
    let mut position: FxHashMap<&str, usize> = FxHashMap::default();
    for (rank, hit) in vector.iter().enumerate() {
        if position.contains_key(hit.key.as_str()) {
            continue;
        }
        position.insert(&hit.key, entries.len());
        entries.push(Entry {
            key: hit.key.clone(),
            vector: Some((rank + 1, hit.distance)),
            text: None,
        });
    }
    for (rank, hit) in text.iter().enumerate() {
        match position.get(hit.key.as_str()) {
            Some(&i) => {
                if entries[i].text.is_none() {
                    entries[i].text = Some((rank + 1, hit.score));
                }
            }
            None => {
                position.insert(&hit.key, entries.len());
                entries.push(Entry {
                    key: hit.key.clone(),
                    vector: None,
                    text: Some((rank + 1, hit.score)),
                });
            }
        }
    }
    entries
}

fn finish(entries: Vec<Entry>, score: impl Fn(&Entry) -> f64) -> Vec<FusedHit> {
    let mut fused: Vec<FusedHit> = entries
        .iter()
        .map(|entry| FusedHit {
            key: entry.key.clone(),
            score: score(entry),
            vector_rank: entry.vector.map(|(rank, _)| rank),
            text_rank: entry.text.map(|(rank, _)| rank),
        })
        .collect();
    // stable: equal scores keep merge order
    fused.sort_by(|a, b| b.score.total_cmp(&a.score));
    fused
}

/// Reciprocal rank fusion: `Σ weight / (k + rank)` over the lists a document
/// appears in.
pub fn reciprocal_rank_fusion(
    vector: &[VectorHit],
    text: &[TextHit],
    k: f64,
    vector_weight: f64,
    text_weight: f64,
) -> Vec<FusedHit> {
    finish(merge(vector, text), |entry| {
        let v = entry
            .vector
            .map_or(0.0, |(rank, _)| vector_weight / (k + rank as f64));
        let t = entry
            .text
            .map_or(0.0, |(rank, _)| text_weight / (k + rank as f64));
        v + t
    })
}

/// Linear blend of the normalized vector similarity `1 / (1 + distance)` and
/// the normalized text score: `alpha * vector + (1 - alpha) * text`.
pub fn weighted_fusion(vector: &[VectorHit], text: &[TextHit], alpha: f64) -> Vec<FusedHit> {
    let similarity = |distance: f64| 1.0 / (1.0 + distance.max(0.0));
    let max_similarity = vector
        .iter()
        .map(|hit| similarity(hit.distance))
        .fold(0.0_f64, f64::max);
    let max_text = text.iter().map(|hit| hit.score).fold(0.0_f64, f64::max);
    let normalize = |value: f64, max: f64| if max > 0.0 { value / max } else { 0.0 };
    finish(merge(vector, text), |entry| {
        let v = entry
            .vector
            .map_or(0.0, |(_, d)| normalize(similarity(d), max_similarity));
        let t = entry.text.map_or(0.0, |(_, s)| normalize(s, max_text));
        alpha * v + (1.0 - alpha) * t
    })
}

/// Applies the configured cutoffs and fusion strategy.
pub fn fuse(vector: &[VectorHit], text: &[TextHit], config: &FusionConfig) -> Vec<FusedHit> {
    let vector: Vec<VectorHit> = match config.max_vector_distance {
        Some(max) => vector.iter().filter(|h| h.distance <= max).cloned().collect(),
        None => vector.to_vec(),
    };
    let text: Vec<TextHit> = match config.min_text_score {
        Some(min) => text.iter().filter(|h| h.score >= min).cloned().collect(),
        None => text.to_vec(),
    };
    match config.mode {
        FusionMode::Rrf => reciprocal_rank_fusion(
            &vector,
            &text,
            config.k,
            config.vector_weight,
            config.fulltext_weight,
        ),
        FusionMode::Weighted => weighted_fusion(&vector, &text, config.alpha),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vhit(key: &str, distance: f64) -> VectorHit {
        VectorHit {
            key: key.into(),
            distance,
        }
    }

    fn thit(key: &str, score: f64) -> TextHit {
        TextHit {
            key: key.into(),
            score,
        }
    }

    #[test]
    fn rrf_rewards_documents_in_both_lists() {
        let fused = reciprocal_rank_fusion(
            &[vhit("A", 0.1), vhit("B", 0.2)],
            &[thit("B", 9.0), thit("C", 3.0)],
            60.0,
            0.5,
            0.5,
        );
        let keys: Vec<&str> = fused.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["B", "A", "C"]);
        let b = &fused[0];
        assert!((b.score - (0.5 / 62.0 + 0.5 / 61.0)).abs() < 1e-12);
        assert_eq!((b.vector_rank, b.text_rank), (Some(2), Some(1)));
        assert!((fused[1].score - 0.5 / 61.0).abs() < 1e-12);
        assert!((fused[2].score - 0.5 / 62.0).abs() < 1e-12);
    }

    #[test]
    fn equal_scores_keep_vector_order_first() {
        let fused = reciprocal_rank_fusion(&[vhit("X", 0.5)], &[thit("Y", 1.0)], 60.0, 0.5, 0.5);
        let keys: Vec<&str> = fused.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["X", "Y"]);
    }

    #[test]
    fn weighted_mode_blends_normalized_scores() {
        let fused = weighted_fusion(
            &[vhit("A", 0.0), vhit("B", 1.0)],
            &[thit("B", 4.0), thit("C", 2.0)],
            0.5,
        );
        let score = |key: &str| {
            fused
                .iter()
                .find(|h| h.key == key)
                .map(|h| h.score)
                .expect("present")
        };
        assert!((score("A") - 0.5).abs() < 1e-12);
        assert!((score("B") - (0.5 * 0.5 + 0.5)).abs() < 1e-12);
        assert!((score("C") - 0.25).abs() < 1e-12);
        assert_eq!(fused[0].key, "B");
    }

    #[test]
    fn cutoffs_apply_before_fusion() {
        let config = FusionConfig {
            min_text_score: Some(2.5),
            max_vector_distance: Some(0.5),
            ..FusionConfig::default()
        };
        let fused = fuse(
            &[vhit("A", 0.1), vhit("B", 0.9)],
            &[thit("B", 3.0), thit("C", 1.0)],
            &config,
        );
        let keys: Vec<&str> = fused.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["A", "B"]);
        assert_eq!(fused[1].text_rank, Some(1));
    }
}
