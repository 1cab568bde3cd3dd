use serde::{Deserialize, Serialize};

pub const CENTRAL_ROSTER: &str = "central";
pub const CENTRAL_ROSTER_URL: &str = "https://github.com/machbase/neo-pkg.git";
pub const CENTRAL_ROSTER_BRANCH: &str = "main";

/// A named catalog partition backed by one upstream git repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterSource {
    pub name: String,
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

impl RosterSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            branch: default_branch(),
        }
    }
}

pub fn default_rosters() -> Vec<RosterSource> {
    vec![RosterSource::new(CENTRAL_ROSTER, CENTRAL_ROSTER_URL)]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RosterSyncStatus {
    Cloned,
    Updated,
    UpToDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterSyncResult {
    pub roster: String,
    pub status: RosterSyncStatus,
    pub snapshot_id: String,
}

fn default_branch() -> String {
    CENTRAL_ROSTER_BRANCH.to_string()
}
