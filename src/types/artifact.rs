use crate::types::request::VersionSelector;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    NotStarted,
    Building,
    Failed,
    Success,
}

impl BuildStatus {
    pub fn code(&self) -> i32 {
        match self {
            BuildStatus::NotStarted => 0,
            BuildStatus::Building => 1,
            BuildStatus::Failed => 2,
            BuildStatus::Success => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Failed | BuildStatus::Success)
    }
}

/// Source build artifact: a tarball under the shared build dir, extracted
/// into a versioned dir on the build host. Immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub app_id: i64,
    pub env_id: i64,
    pub deploy_id: i64,
    pub version: String,
    pub spug_version: String,
    pub extra: VersionSelector,
    #[serde(default)]
    pub status: BuildStatus,
    #[serde(default)]
    pub remarks: String,
    pub created_at: DateTime<Utc>,
}

/// Container image artifact, produced on top of a Repository build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerImage {
    pub id: i64,
    pub app_id: i64,
    pub env_id: i64,
    pub deploy_id: i64,
    pub repository_id: Option<i64>,
    pub version: String,
    pub spug_version: String,
    pub extra: VersionSelector,
    /// Resolved `registry/prefix/name:version` once the push succeeded.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub status: BuildStatus,
    #[serde(default)]
    pub remarks: String,
    pub created_at: DateTime<Utc>,
}

/// Build-version id: distinguishes build attempts, independent of the
/// user-facing version label.
pub fn make_spug_version(deploy_id: i64) -> String {
    format!("{}_{}", deploy_id, Local::now().format("%Y%m%d%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spug_version_is_prefixed_by_deploy_id() {
        let v = make_spug_version(42);
        assert!(v.starts_with("42_"));
        assert_eq!(v.len(), "42_".len() + 14);
    }

    #[test]
    fn status_codes_match_store() {
        assert_eq!(BuildStatus::NotStarted.code(), 0);
        assert_eq!(BuildStatus::Building.code(), 1);
        assert_eq!(BuildStatus::Failed.code(), 2);
        assert_eq!(BuildStatus::Success.code(), 5);
        assert!(BuildStatus::Success.is_terminal());
        assert!(!BuildStatus::Building.is_terminal());
    }
}
