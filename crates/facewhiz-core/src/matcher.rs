//! Nearest-neighbor recognition over a snapshot of enrolled descriptors.

use crate::types::{Descriptor, DescriptorError, Person};
use serde::Serialize;
use thiserror::Error;

/// Decision threshold used when the caller does not supply one.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
    #[error("descriptor length mismatch: stored={stored}, provided={query}")]
    DimensionMismatch { stored: usize, query: usize },
}

/// One stored descriptor paired with its owning person.
///
/// The store only yields rows that pass descriptor validation, but the
/// matcher does not rely on it: entries whose length disagrees with the
/// probe are never compared.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub descriptor_id: String,
    pub person: Person,
    pub values: Vec<f32>,
}

/// Outcome of scanning a gallery for the closest descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the closest comparable entry, `None` if nothing was compared.
    pub distance: Option<f64>,
    /// Gallery index of the closest entry.
    pub best_index: Option<usize>,
}

/// Strategy for finding the closest enrolled descriptor to a probe.
///
/// Implementations must keep the first-encountered entry on ties.
pub trait Matcher {
    fn compare(&self, probe: &Descriptor, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Brute-force linear scan by Euclidean distance.
///
/// Cost is O(n·d) per query. Fine for small registries; a larger one
/// would plug an indexed implementation in behind [`Matcher`].
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Descriptor, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let threshold = f64::from(threshold);
        let mut best_dist = f64::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            if entry.values.len() != probe.len() {
                continue;
            }
            let Some(dist) = probe.euclidean_distance(&entry.values) else {
                continue;
            };
            // Only reachable for gallery values that bypassed validation.
            if !dist.is_finite() {
                tracing::warn!(
                    descriptor_id = %entry.descriptor_id,
                    "skipping stored descriptor with non-finite distance"
                );
                continue;
            }
            // Strict comparison: ties keep the earlier entry.
            if best_idx.is_none() || dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) => MatchResult {
                matched: best_dist <= threshold,
                distance: Some(best_dist),
                best_index: Some(idx),
            },
            None => MatchResult {
                matched: false,
                distance: None,
                best_index: None,
            },
        }
    }
}

/// Verdict of a recognition request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    /// Matched person, without descriptors.
    #[serde(rename = "match")]
    pub person: Option<Person>,
    pub distance: Option<f64>,
    #[serde(rename = "thresholdUsed")]
    pub threshold: f32,
}

impl Recognition {
    fn empty(threshold: f32) -> Self {
        Self {
            person: None,
            distance: None,
            threshold,
        }
    }
}

/// Resolve the decision threshold. NaN is treated as "not supplied".
pub fn resolve_threshold(threshold: Option<f32>) -> f32 {
    resolve_threshold_or(threshold, DEFAULT_THRESHOLD)
}

/// Like [`resolve_threshold`], falling back to `default` instead of
/// [`DEFAULT_THRESHOLD`].
pub fn resolve_threshold_or(threshold: Option<f32>, default: f32) -> f32 {
    threshold.filter(|t| !t.is_nan()).unwrap_or(default)
}

/// Identify `query` against `gallery`.
///
/// The reference dimensionality is the length of the first non-empty
/// gallery entry; entries of any other length are ignored. An empty
/// gallery is a normal no-match outcome, while a gallery whose reference
/// dimensionality differs from the query is a [`MatchError::DimensionMismatch`].
pub fn recognize<M: Matcher + ?Sized>(
    matcher: &M,
    query: &[f32],
    threshold: Option<f32>,
    gallery: &[GalleryEntry],
) -> Result<Recognition, MatchError> {
    let probe = Descriptor::new(query.to_vec())?;
    let threshold = resolve_threshold(threshold);

    let Some(stored) = gallery
        .iter()
        .map(|entry| entry.values.len())
        .find(|len| *len > 0)
    else {
        tracing::debug!("no enrolled descriptors");
        return Ok(Recognition::empty(threshold));
    };

    if stored != probe.len() {
        return Err(MatchError::DimensionMismatch {
            stored,
            query: probe.len(),
        });
    }

    let result = matcher.compare(&probe, gallery, threshold);
    let (Some(distance), Some(idx)) = (result.distance, result.best_index) else {
        tracing::debug!("no comparable descriptors");
        return Ok(Recognition::empty(threshold));
    };

    let entry = &gallery[idx];
    if result.matched {
        tracing::info!(
            person_id = %entry.person.id,
            descriptor_id = %entry.descriptor_id,
            distance,
            threshold,
            "match found"
        );
        Ok(Recognition {
            person: Some(entry.person.clone()),
            distance: Some(distance),
            threshold,
        })
    } else {
        tracing::info!(distance, threshold, "no match within threshold");
        Ok(Recognition {
            person: None,
            distance: Some(distance),
            threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewPerson;
    use chrono::Utc;

    fn unit(len: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; len];
        v[hot] = 1.0;
        v
    }

    fn entry(descriptor_id: &str, person_id: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            descriptor_id: descriptor_id.into(),
            person: NewPerson::named(person_id).into_person(person_id.into(), Utc::now()),
            values,
        }
    }

    fn two_person_gallery() -> Vec<GalleryEntry> {
        vec![
            entry("d1", "p1", unit(128, 0)),
            entry("d2", "p2", unit(128, 1)),
        ]
    }

    #[test]
    fn test_empty_gallery_is_not_an_error() {
        let result = recognize(&EuclideanMatcher, &unit(128, 0), None, &[]).unwrap();
        assert_eq!(result, Recognition::empty(0.5));
    }

    #[test]
    fn test_exact_match_has_zero_distance() {
        let gallery = two_person_gallery();
        for t in [0.0, 0.1, 0.5, 10.0] {
            let result = recognize(&EuclideanMatcher, &unit(128, 0), Some(t), &gallery).unwrap();
            assert_eq!(result.distance, Some(0.0));
            assert_eq!(result.person.as_ref().map(|p| p.id.as_str()), Some("p1"));
            assert_eq!(result.threshold, t);
        }
    }

    #[test]
    fn test_midpoint_tie_picks_first_and_rejects() {
        let gallery = two_person_gallery();
        let mut query = vec![0.0; 128];
        query[0] = 0.5;
        query[1] = 0.5;

        let probe = Descriptor::new(query.clone()).unwrap();
        let result = EuclideanMatcher.compare(&probe, &gallery, 0.5);
        assert_eq!(result.best_index, Some(0));
        assert!(!result.matched);

        let verdict = recognize(&EuclideanMatcher, &query, Some(0.5), &gallery).unwrap();
        assert!(verdict.person.is_none());
        let d = verdict.distance.unwrap();
        assert!((d - 0.5f64.sqrt()).abs() < 1e-9, "got {d}");
        assert_eq!(verdict.threshold, 0.5);
    }

    #[test]
    fn test_distance_reported_on_no_match() {
        let gallery = vec![entry("d1", "p1", unit(128, 0))];
        let result = recognize(&EuclideanMatcher, &unit(128, 5), Some(0.3), &gallery).unwrap();
        assert!(result.person.is_none());
        assert!((result.distance.unwrap() - 2.0f64.sqrt()).abs() < 1e-9);
        assert_eq!(result.threshold, 0.3);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let gallery = vec![entry("d1", "p1", unit(128, 0))];
        let mut query = unit(128, 0);
        query[0] = 0.75;
        let result = recognize(&EuclideanMatcher, &query, Some(0.25), &gallery).unwrap();
        assert_eq!(result.distance, Some(0.25));
        assert!(result.person.is_some());
    }

    #[test]
    fn test_closest_wins_regardless_of_position() {
        let mut near = unit(128, 2);
        near[3] = 0.1;
        let gallery = vec![
            entry("d1", "p1", unit(128, 0)),
            entry("d2", "p2", unit(128, 1)),
            entry("d3", "p3", near),
        ];
        let result = recognize(&EuclideanMatcher, &unit(128, 2), None, &gallery).unwrap();
        assert_eq!(result.person.map(|p| p.id), Some("p3".to_string()));
    }

    #[test]
    fn test_invalid_query_rejected() {
        let gallery = two_person_gallery();
        assert_eq!(
            recognize(&EuclideanMatcher, &[], None, &gallery),
            Err(MatchError::InvalidDescriptor(DescriptorError::Empty))
        );
        assert_eq!(
            recognize(&EuclideanMatcher, &[0.0; 64], None, &gallery),
            Err(MatchError::InvalidDescriptor(DescriptorError::InvalidLength(64)))
        );
    }

    #[test]
    fn test_dimension_mismatch_when_data_exists() {
        let gallery = two_person_gallery();
        assert_eq!(
            recognize(&EuclideanMatcher, &unit(256, 0), None, &gallery),
            Err(MatchError::DimensionMismatch { stored: 128, query: 256 })
        );
    }

    #[test]
    fn test_reference_dimension_from_first_entry() {
        // First entry fixes the reference; the 256-d entry is ignored.
        let gallery = vec![
            entry("d1", "p1", unit(128, 0)),
            entry("d2", "p2", unit(256, 0)),
        ];
        let result = recognize(&EuclideanMatcher, &unit(128, 0), None, &gallery).unwrap();
        assert_eq!(result.person.map(|p| p.id), Some("p1".to_string()));

        assert!(matches!(
            recognize(&EuclideanMatcher, &unit(256, 0), None, &gallery),
            Err(MatchError::DimensionMismatch { stored: 128, query: 256 })
        ));
    }

    #[test]
    fn test_large_magnitude_candidate_reports_distance() {
        let gallery = vec![entry("d1", "p1", vec![1e20; 128])];
        let result = recognize(&EuclideanMatcher, &[0.0; 128], Some(1.0), &gallery).unwrap();
        assert!(result.person.is_none());
        let d = result.distance.expect("compared candidate must report a distance");
        assert!(d.is_finite());
        assert!(d > 1e20);

        let result = recognize(&EuclideanMatcher, &[1e20; 128], Some(1.0), &gallery).unwrap();
        assert_eq!(result.distance, Some(0.0));
        assert_eq!(result.person.map(|p| p.id), Some("p1".to_string()));
    }

    #[test]
    fn test_non_finite_candidate_skipped() {
        let mut broken = vec![0.0; 128];
        broken[0] = f32::INFINITY;
        let gallery = vec![entry("d1", "p1", broken), entry("d2", "p2", unit(128, 1))];
        let result = recognize(&EuclideanMatcher, &unit(128, 1), None, &gallery).unwrap();
        assert_eq!(result.distance, Some(0.0));
        assert_eq!(result.person.map(|p| p.id), Some("p2".to_string()));
    }

    #[test]
    fn test_nan_threshold_falls_back_to_default() {
        assert_eq!(resolve_threshold(Some(f32::NAN)), DEFAULT_THRESHOLD);
        assert_eq!(resolve_threshold(None), DEFAULT_THRESHOLD);
        assert_eq!(resolve_threshold(Some(0.8)), 0.8);
    }

    #[test]
    fn test_threshold_fallback_is_configurable() {
        assert_eq!(resolve_threshold_or(None, 0.4), 0.4);
        assert_eq!(resolve_threshold_or(Some(f32::NAN), 0.4), 0.4);
        assert_eq!(resolve_threshold_or(Some(0.9), 0.4), 0.9);
    }

    #[test]
    fn test_recognition_serializes_wire_names() {
        let json = serde_json::to_value(Recognition::empty(0.5)).unwrap();
        assert!(json["match"].is_null());
        assert!(json["distance"].is_null());
        assert_eq!(json["thresholdUsed"], 0.5);
    }
}
