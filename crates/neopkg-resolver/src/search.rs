use std::cmp::Ordering;

use crate::dice_coefficient;

/// Candidates must score strictly above this to be suggested.
pub const SIMILARITY_THRESHOLD: f64 = 0.1;
pub const MAX_POSSIBLES: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct RankedName {
    pub name: String,
    pub score: f64,
}

/// Scores `candidates` against `query` and returns at most `limit` (capped at
/// [`MAX_POSSIBLES`]) names, best first. Equal scores are ordered by name.
pub fn rank_candidates<I, S>(query: &str, candidates: I, limit: usize) -> Vec<RankedName>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let limit = limit.min(MAX_POSSIBLES);
    if limit == 0 || query.is_empty() {
        return Vec::new();
    }

    let mut ranked: Vec<RankedName> = candidates
        .into_iter()
        .map(|candidate| RankedName {
            score: dice_coefficient(query, candidate.as_ref()),
            name: candidate.as_ref().to_string(),
        })
        .filter(|ranked| ranked.score > SIMILARITY_THRESHOLD)
        .collect();

    ranked.sort_by(|left, right| {
        right
            .score
            .partial_cmp(&left.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| left.name.cmp(&right.name))
    });
    ranked.dedup_by(|right, left| right.name == left.name);
    ranked.truncate(limit);
    ranked
}
