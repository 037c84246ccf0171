//! Matching of a query embedding against the reference set.

use crate::embedder::FaceEmbedding;
use anyhow::anyhow;
use std::str::FromStr;

/// Default maximum L2 distance at which two embeddings are the same person
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// A known face: its embedding and the identity that logs in with it
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceEntry {
    pub embedding: FaceEmbedding,
    pub identity: String,
}

impl ReferenceEntry {
    pub fn new(embedding: impl Into<FaceEmbedding>, identity: impl Into<String>) -> Self {
        Self {
            embedding: embedding.into(),
            identity: identity.into(),
        }
    }
}

/// An accepted match
#[derive(Debug, Clone, PartialEq)]
pub struct FaceMatch {
    pub identity: String,
    pub distance: f32,
    /// Position of the matched entry in the reference set
    pub index: usize,
}

/// How a match is chosen among the references within tolerance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    /// The first reference, in set order, within tolerance
    #[default]
    FirstWithinTolerance,
    /// The globally closest reference, if within tolerance
    Nearest,
}

impl FromStr for MatchPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "first" | "first_within_tolerance" => Ok(Self::FirstWithinTolerance),
            "nearest" => Ok(Self::Nearest),
            other => Err(anyhow!("unknown match policy '{}'", other)),
        }
    }
}

/// Accept the first reference whose distance to `query` is within `tolerance`.
///
/// Later entries are not examined once one is accepted, so a closer entry
/// further down the set loses to an earlier acceptable one.
pub fn match_first(
    query: &FaceEmbedding,
    references: &[ReferenceEntry],
    tolerance: f32,
) -> Option<FaceMatch> {
    references
        .iter()
        .enumerate()
        .find_map(|(index, entry)| {
            let distance = query.distance(&entry.embedding);
            (distance <= tolerance).then(|| FaceMatch {
                identity: entry.identity.clone(),
                distance,
                index,
            })
        })
}

/// Accept the closest reference if it is within `tolerance`.
///
/// Ties go to the earlier entry.
pub fn match_nearest(
    query: &FaceEmbedding,
    references: &[ReferenceEntry],
    tolerance: f32,
) -> Option<FaceMatch> {
    let mut best: Option<FaceMatch> = None;

    for (index, entry) in references.iter().enumerate() {
        let distance = query.distance(&entry.embedding);
        if !(distance <= tolerance) {
            continue;
        }
        if best.as_ref().map_or(true, |b| distance < b.distance) {
            best = Some(FaceMatch {
                identity: entry.identity.clone(),
                distance,
                index,
            });
        }
    }

    best
}

/// Tolerance and policy bound together
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchEngine {
    tolerance: f32,
    policy: MatchPolicy,
}

impl MatchEngine {
    pub fn new(tolerance: f32, policy: MatchPolicy) -> Self {
        Self { tolerance, policy }
    }

    pub fn find(&self, query: &FaceEmbedding, references: &[ReferenceEntry]) -> Option<FaceMatch> {
        match self.policy {
            MatchPolicy::FirstWithinTolerance => match_first(query, references, self.tolerance),
            MatchPolicy::Nearest => match_nearest(query, references, self.tolerance),
        }
    }
}

impl Default for MatchEngine {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE, MatchPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(values: &[f32], identity: &str) -> ReferenceEntry {
        ReferenceEntry::new(values.to_vec(), identity)
    }

    #[test]
    fn test_exact_embedding_matches() {
        let query = FaceEmbedding::from(vec![0.2, 0.4, 0.6]);
        let references = vec![entry(&[0.2, 0.4, 0.6], "user@example.com")];

        let found = match_first(&query, &references, DEFAULT_TOLERANCE).unwrap();
        assert_eq!(found.identity, "user@example.com");
        assert_eq!(found.distance, 0.0);

        // Zero tolerance still accepts an identical embedding
        assert!(match_first(&query, &references, 0.0).is_some());
    }

    #[test]
    fn test_nothing_within_tolerance() {
        let query = FaceEmbedding::from(vec![0.0, 0.0]);
        let references = vec![entry(&[1.0, 0.0], "a"), entry(&[0.0, -0.7], "b")];

        assert_eq!(match_first(&query, &references, DEFAULT_TOLERANCE), None);
        assert_eq!(match_nearest(&query, &references, DEFAULT_TOLERANCE), None);
    }

    #[test]
    fn test_tolerance_is_inclusive() {
        let query = FaceEmbedding::from(vec![0.0, 0.0]);
        let references = vec![entry(&[0.5, 0.0], "edge")];

        assert!(match_first(&query, &references, 0.5).is_some());
        assert!(match_first(&query, &references, 0.49).is_none());
    }

    #[test]
    fn test_first_acceptable_not_best() {
        let query = FaceEmbedding::from(vec![0.0, 0.0]);
        // A is listed first and is farther than B; both are within tolerance
        let references = vec![
            entry(&[0.5, 0.0], "a@example.com"),
            entry(&[0.1, 0.0], "b@example.com"),
        ];

        let found = match_first(&query, &references, DEFAULT_TOLERANCE).unwrap();
        assert_eq!(found.identity, "a@example.com");
        assert_eq!(found.index, 0);

        let nearest = match_nearest(&query, &references, DEFAULT_TOLERANCE).unwrap();
        assert_eq!(nearest.identity, "b@example.com");
        assert_eq!(nearest.index, 1);
    }

    #[test]
    fn test_empty_reference_set() {
        let query = FaceEmbedding::from(vec![0.0, 0.0]);
        assert!(MatchEngine::default().find(&query, &[]).is_none());
    }

    #[test]
    fn test_mismatched_dimensions_never_match() {
        let query = FaceEmbedding::from(vec![0.0, 0.0]);
        let references = vec![entry(&[0.0, 0.0, 0.0], "other-model")];
        assert!(match_first(&query, &references, f32::MAX).is_none());
    }

    #[test]
    fn test_engine_dispatches_on_policy() {
        let query = FaceEmbedding::from(vec![0.0]);
        let references = vec![entry(&[0.3], "first"), entry(&[0.1], "closest")];

        let first = MatchEngine::new(0.6, MatchPolicy::FirstWithinTolerance);
        let nearest = MatchEngine::new(0.6, MatchPolicy::Nearest);
        assert_eq!(first.find(&query, &references).unwrap().identity, "first");
        assert_eq!(nearest.find(&query, &references).unwrap().identity, "closest");
    }

    #[test]
    fn test_match_policy_from_str() {
        assert_eq!("first".parse::<MatchPolicy>().unwrap(), MatchPolicy::FirstWithinTolerance);
        assert_eq!(" Nearest ".parse::<MatchPolicy>().unwrap(), MatchPolicy::Nearest);
        assert!("best".parse::<MatchPolicy>().is_err());
    }
}
