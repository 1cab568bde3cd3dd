mod github;
mod search;
mod similarity;

pub use github::{GithubClient, DEFAULT_GITHUB_API, GITHUB_TOKEN_ENV};
pub use search::{rank_candidates, RankedName, MAX_POSSIBLES, SIMILARITY_THRESHOLD};
pub use similarity::dice_coefficient;
