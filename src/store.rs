//! Storage seams.
//!
//! The pipeline never talks to a database: each entity is reached through a
//! narrow DAO trait, and the in-memory implementations below back both the
//! CLI and the tests. A relational persister plugs in behind the same
//! traits.

use crate::channel::LogHub;
use crate::context::parse_config_text;
use crate::error::Result;
use crate::executor::{SessionFactory, SshSessionFactory};
use crate::types::{
    DeployRequest, DockerImage, FileTemplate, HostRecord, RegistryRecord, Repository, TemplateKind,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub trait HostStore: Send + Sync {
    fn get(&self, id: i64) -> Option<HostRecord>;
}

pub trait RepositoryStore: Send + Sync {
    fn get(&self, id: i64) -> Option<Repository>;
    /// Insert or update; assigns an id when the record has none (id 0).
    fn save(&self, rep: Repository) -> Repository;
}

pub trait ImageStore: Send + Sync {
    fn get(&self, id: i64) -> Option<DockerImage>;
    fn save(&self, image: DockerImage) -> DockerImage;
    /// Published image lookup backing the overwrite guard.
    fn find_success(&self, app_id: i64, env_id: i64, version: &str) -> Option<DockerImage>;
}

pub trait TemplateStore: Send + Sync {
    fn find(&self, env_id: i64, kind: TemplateKind) -> Option<FileTemplate>;
}

pub trait RegistryStore: Send + Sync {
    fn find_all(&self, env_id: i64) -> Vec<RegistryRecord>;
}

pub trait ConfigStore: Send + Sync {
    /// Resolved key/value configuration set for (application, environment).
    fn resolved(&self, app_id: i64, env_id: i64) -> Vec<(String, String)>;
}

pub trait RequestStore: Send + Sync {
    /// Final/failure-set write at the end of one run.
    fn persist(&self, req: &DeployRequest);
}

pub trait TokenStore: Send + Sync {
    /// Short-lived api token handed to hooks via `SPUG_API_TOKEN`.
    fn register(&self, token: &str, app_id: i64, env_id: i64);
}

/// Shared filesystem roots: checkouts under `repos_dir`, packaged tarballs
/// and rendered template files under `build_dir`.
#[derive(Debug, Clone)]
pub struct SharedPaths {
    pub repos_dir: PathBuf,
    pub build_dir: PathBuf,
}

impl SharedPaths {
    pub fn new(repos_dir: impl Into<PathBuf>, build_dir: impl Into<PathBuf>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
            build_dir: build_dir.into(),
        }
    }

    pub fn checkout_dir(&self, deploy_id: i64) -> PathBuf {
        self.repos_dir.join(deploy_id.to_string())
    }

    pub fn tarball(&self, spug_version: &str) -> PathBuf {
        self.build_dir.join(format!("{spug_version}.tar.gz"))
    }

    /// File stored at publish time for "upload on publish" transfers.
    pub fn published_file(&self, deploy_id: i64, spug_version: &str) -> PathBuf {
        self.checkout_dir(deploy_id).join(spug_version)
    }
}

/// Everything a dispatch needs, bundled; cheap to clone into host workers.
#[derive(Clone)]
pub struct Services {
    pub hosts: Arc<dyn HostStore>,
    pub repositories: Arc<dyn RepositoryStore>,
    pub images: Arc<dyn ImageStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub registries: Arc<dyn RegistryStore>,
    pub configs: Arc<dyn ConfigStore>,
    pub requests: Arc<dyn RequestStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub sessions: Arc<dyn SessionFactory>,
    pub log: LogHub,
    pub paths: SharedPaths,
}

// ---------------------------------------------------------------------------
// In-memory implementations

#[derive(Default)]
pub struct MemoryHostStore {
    hosts: Mutex<HashMap<i64, HostRecord>>,
}

impl MemoryHostStore {
    pub fn insert(&self, host: HostRecord) {
        self.hosts.lock().unwrap().insert(host.id, host);
    }
}

impl HostStore for MemoryHostStore {
    fn get(&self, id: i64) -> Option<HostRecord> {
        self.hosts.lock().unwrap().get(&id).cloned()
    }
}

#[derive(Default)]
pub struct MemoryRepositoryStore {
    rows: Mutex<HashMap<i64, Repository>>,
    next_id: Mutex<i64>,
}

impl RepositoryStore for MemoryRepositoryStore {
    fn get(&self, id: i64) -> Option<Repository> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    fn save(&self, mut rep: Repository) -> Repository {
        if rep.id == 0 {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            rep.id = *next;
        }
        self.rows.lock().unwrap().insert(rep.id, rep.clone());
        rep
    }
}

#[derive(Default)]
pub struct MemoryImageStore {
    rows: Mutex<HashMap<i64, DockerImage>>,
    next_id: Mutex<i64>,
}

impl ImageStore for MemoryImageStore {
    fn get(&self, id: i64) -> Option<DockerImage> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    fn save(&self, mut image: DockerImage) -> DockerImage {
        if image.id == 0 {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            image.id = *next;
        }
        self.rows.lock().unwrap().insert(image.id, image.clone());
        image
    }

    fn find_success(&self, app_id: i64, env_id: i64, version: &str) -> Option<DockerImage> {
        self.rows
            .lock()
            .unwrap()
            .values()
            .find(|img| {
                img.app_id == app_id
                    && img.env_id == env_id
                    && img.version == version
                    && img.status == crate::types::BuildStatus::Success
            })
            .cloned()
    }
}

#[derive(Default)]
pub struct MemoryTemplateStore {
    rows: Mutex<Vec<FileTemplate>>,
}

impl MemoryTemplateStore {
    pub fn insert(&self, template: FileTemplate) {
        self.rows.lock().unwrap().push(template);
    }
}

impl TemplateStore for MemoryTemplateStore {
    fn find(&self, env_id: i64, kind: TemplateKind) -> Option<FileTemplate> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.env_id == env_id && t.kind == kind)
            .cloned()
    }
}

#[derive(Default)]
pub struct MemoryRegistryStore {
    rows: Mutex<Vec<RegistryRecord>>,
}

impl MemoryRegistryStore {
    pub fn insert(&self, record: RegistryRecord) {
        self.rows.lock().unwrap().push(record);
    }
}

impl RegistryStore for MemoryRegistryStore {
    fn find_all(&self, env_id: i64) -> Vec<RegistryRecord> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.env_id == env_id)
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryConfigStore {
    rows: Mutex<HashMap<(i64, i64), Vec<(String, String)>>>,
}

impl MemoryConfigStore {
    pub fn insert(&self, app_id: i64, env_id: i64, pairs: Vec<(String, String)>) {
        self.rows.lock().unwrap().insert((app_id, env_id), pairs);
    }

    /// Seed from a `key = value` text body, appended after any pairs already
    /// present for the same (application, environment).
    pub fn insert_text(&self, app_id: i64, env_id: i64, text: &str) -> Result<()> {
        let pairs = parse_config_text(text)?;
        self.rows
            .lock()
            .unwrap()
            .entry((app_id, env_id))
            .or_default()
            .extend(pairs);
        Ok(())
    }
}

impl ConfigStore for MemoryConfigStore {
    fn resolved(&self, app_id: i64, env_id: i64) -> Vec<(String, String)> {
        self.rows
            .lock()
            .unwrap()
            .get(&(app_id, env_id))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct MemoryRequestStore {
    persisted: Mutex<Vec<DeployRequest>>,
}

impl MemoryRequestStore {
    pub fn last(&self) -> Option<DeployRequest> {
        self.persisted.lock().unwrap().last().cloned()
    }
}

impl RequestStore for MemoryRequestStore {
    fn persist(&self, req: &DeployRequest) {
        self.persisted.lock().unwrap().push(req.clone());
    }
}

#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, (i64, i64)>>,
}

impl MemoryTokenStore {
    pub fn lookup(&self, token: &str) -> Option<(i64, i64)> {
        self.tokens.lock().unwrap().get(token).copied()
    }
}

impl TokenStore for MemoryTokenStore {
    fn register(&self, token: &str, app_id: i64, env_id: i64) {
        self.tokens
            .lock()
            .unwrap()
            .insert(token.to_string(), (app_id, env_id));
    }
}

/// In-memory backend: concrete stores for seeding plus a `Services` view.
pub struct MemoryBackend {
    pub hosts: Arc<MemoryHostStore>,
    pub repositories: Arc<MemoryRepositoryStore>,
    pub images: Arc<MemoryImageStore>,
    pub templates: Arc<MemoryTemplateStore>,
    pub registries: Arc<MemoryRegistryStore>,
    pub configs: Arc<MemoryConfigStore>,
    pub requests: Arc<MemoryRequestStore>,
    pub tokens: Arc<MemoryTokenStore>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            hosts: Arc::new(MemoryHostStore::default()),
            repositories: Arc::new(MemoryRepositoryStore::default()),
            images: Arc::new(MemoryImageStore::default()),
            templates: Arc::new(MemoryTemplateStore::default()),
            registries: Arc::new(MemoryRegistryStore::default()),
            configs: Arc::new(MemoryConfigStore::default()),
            requests: Arc::new(MemoryRequestStore::default()),
            tokens: Arc::new(MemoryTokenStore::default()),
        }
    }

    pub fn services(
        &self,
        sessions: Arc<dyn SessionFactory>,
        paths: SharedPaths,
    ) -> Services {
        Services {
            hosts: self.hosts.clone(),
            repositories: self.repositories.clone(),
            images: self.images.clone(),
            templates: self.templates.clone(),
            registries: self.registries.clone(),
            configs: self.configs.clone(),
            requests: self.requests.clone(),
            tokens: self.tokens.clone(),
            sessions,
            log: LogHub::new(),
            paths,
        }
    }

    /// Default services wired to the `ssh`/`scp` session factory.
    pub fn ssh_services(&self, repos_dir: &Path, build_dir: &Path) -> Services {
        self.services(
            Arc::new(SshSessionFactory),
            SharedPaths::new(repos_dir, build_dir),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BuildStatus, VersionSelector};
    use chrono::Utc;

    #[test]
    fn repository_store_assigns_ids() {
        let store = MemoryRepositoryStore::default();
        let rep = store.save(Repository {
            id: 0,
            app_id: 1,
            env_id: 2,
            deploy_id: 3,
            version: "v1".into(),
            spug_version: "3_20240101000000".into(),
            extra: VersionSelector::Tag("v1".into()),
            status: BuildStatus::NotStarted,
            remarks: String::new(),
            created_at: Utc::now(),
        });
        assert_eq!(rep.id, 1);
        assert!(store.get(1).is_some());
    }

    #[test]
    fn config_text_seeds_the_resolved_set() {
        let store = MemoryConfigStore::default();
        store.insert(1, 2, vec![("run_env".into(), "prod".into())]);
        store
            .insert_text(1, 2, "# build\nimage_tag = 1.0\n")
            .unwrap();
        assert_eq!(
            store.resolved(1, 2),
            vec![
                ("run_env".to_string(), "prod".to_string()),
                ("image_tag".to_string(), "1.0".to_string()),
            ]
        );
        assert!(store.insert_text(1, 2, "not a pair").is_err());
    }

    #[test]
    fn image_success_lookup_ignores_non_terminal_rows() {
        let store = MemoryImageStore::default();
        let mut image = DockerImage {
            id: 0,
            app_id: 1,
            env_id: 2,
            deploy_id: 3,
            repository_id: None,
            version: "1.0".into(),
            spug_version: "3_20240101000000".into(),
            extra: VersionSelector::Tag("1.0".into()),
            url: String::new(),
            status: BuildStatus::Building,
            remarks: String::new(),
            created_at: Utc::now(),
        };
        image = store.save(image);
        assert!(store.find_success(1, 2, "1.0").is_none());
        image.status = BuildStatus::Success;
        store.save(image);
        assert!(store.find_success(1, 2, "1.0").is_some());
    }
}
