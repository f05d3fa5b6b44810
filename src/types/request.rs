use crate::error::{DeployError, Result};
use crate::types::config::DeployConfig;
use serde::{Deserialize, Serialize};

/// One rollout run against a set of hosts.
///
/// A request is exclusively owned by a single dispatch for its duration and
/// persisted once, at completion. `fail_host_ids` is the resumable-retry
/// state: the subset of `host_ids` that has not yet completed successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub id: i64,
    pub name: String,
    pub deploy: DeployConfig,
    #[serde(default)]
    pub kind: RequestKind,
    pub host_ids: Vec<i64>,
    #[serde(default)]
    pub fail_host_ids: Vec<i64>,
    /// User-facing version label (tag name, `branch#commit`, ...).
    pub version: String,
    /// Generated build identifier, `{deploy_id}_{timestamp}`.
    pub spug_version: String,
    pub extra: VersionSelector,
    /// Original filename for "upload on publish" transfer actions.
    #[serde(default)]
    pub upload_name: Option<String>,
    #[serde(default)]
    pub status: RequestStatus,
    #[serde(default)]
    pub repository_id: Option<i64>,
    #[serde(default)]
    pub image_id: Option<i64>,
}

impl DeployRequest {
    /// `fail_host_ids ⊆ host_ids` must hold at all times.
    pub fn check_fail_set(&self) -> bool {
        self.fail_host_ids.iter().all(|h| self.host_ids.contains(h))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Full build-and-deploy run.
    #[default]
    Deploy,
    /// Re-point the symlink at an already-present version, skipping cleanup
    /// and transfer.
    Rollback,
    /// Containerized variant only: re-run the restart hook, no rebuild.
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
}

impl RequestStatus {
    /// Numeric codes kept compatible with the relational store.
    pub fn code(&self) -> i32 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Running => 2,
            RequestStatus::Success => 3,
            RequestStatus::Failed => -3,
        }
    }
}

/// How the source version was selected. Serialized as the ordered-list
/// descriptor `["tag", t]`, `["branch", b, commit]` or
/// `["repository", id, ...origin...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSelector {
    Tag(String),
    Branch { branch: String, commit: String },
    Repository {
        source_id: i64,
        origin: Box<VersionSelector>,
    },
}

impl VersionSelector {
    pub fn to_list(&self) -> Vec<String> {
        match self {
            VersionSelector::Tag(tag) => vec!["tag".into(), tag.clone()],
            VersionSelector::Branch { branch, commit } => {
                vec!["branch".into(), branch.clone(), commit.clone()]
            }
            VersionSelector::Repository { source_id, origin } => {
                let mut list = vec!["repository".into(), source_id.to_string()];
                list.extend(origin.to_list());
                list
            }
        }
    }

    pub fn from_list(list: &[String]) -> Result<Self> {
        match list.first().map(String::as_str) {
            Some("tag") => {
                let tag = list
                    .get(1)
                    .ok_or_else(|| DeployError::Validation("tag descriptor missing value".into()))?;
                Ok(VersionSelector::Tag(tag.clone()))
            }
            Some("branch") => match (list.get(1), list.get(2)) {
                (Some(branch), Some(commit)) => Ok(VersionSelector::Branch {
                    branch: branch.clone(),
                    commit: commit.clone(),
                }),
                _ => Err(DeployError::Validation(
                    "branch descriptor requires branch and commit".into(),
                )),
            },
            Some("repository") => {
                let source_id = list
                    .get(1)
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| {
                        DeployError::Validation("repository descriptor missing source id".into())
                    })?;
                let origin = VersionSelector::from_list(&list[2..])?;
                Ok(VersionSelector::Repository {
                    source_id,
                    origin: Box::new(origin),
                })
            }
            other => Err(DeployError::Validation(format!(
                "unknown version descriptor {other:?}"
            ))),
        }
    }

    /// Strip the `repository` reuse wrapper, leaving the original tag/branch
    /// selection.
    pub fn origin(&self) -> &VersionSelector {
        match self {
            VersionSelector::Repository { origin, .. } => origin.origin(),
            other => other,
        }
    }

    /// Git ref variables contributed to the deploy environment.
    pub fn git_env(&self) -> Vec<(String, String)> {
        match self.origin() {
            VersionSelector::Tag(tag) => vec![("SPUG_GIT_TAG".into(), tag.clone())],
            VersionSelector::Branch { branch, commit } => vec![
                ("SPUG_GIT_BRANCH".into(), branch.clone()),
                ("SPUG_GIT_COMMIT_ID".into(), commit.clone()),
            ],
            VersionSelector::Repository { .. } => unreachable!("origin() unwraps reuse"),
        }
    }
}

impl Serialize for VersionSelector {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_list().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VersionSelector {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let list = Vec::<String>::deserialize(deserializer)?;
        VersionSelector::from_list(&list).map_err(serde::de::Error::custom)
    }
}
