mod cache_store;
mod catalog;
mod fs_ops;
mod git_ops;
mod roster;

pub use cache_store::CacheStore;
pub use catalog::Catalog;
pub use roster::{
    default_rosters, RosterSource, RosterSyncResult, RosterSyncStatus, CENTRAL_ROSTER,
    CENTRAL_ROSTER_BRANCH, CENTRAL_ROSTER_URL,
};

pub(crate) use fs_ops::unique_suffix;
pub(crate) use git_ops::{git_head_snapshot_id, run_git_clone, run_git_command};
