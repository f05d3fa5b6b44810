//! Shared fixtures: scripted remote sessions and request builders.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use spug_deploy::context::EnvContext;
use spug_deploy::error::Result;
use spug_deploy::executor::{OutputSink, ProgressFn, RemoteSession, SessionFactory};
use spug_deploy::store::{MemoryBackend, Services, SharedPaths};
use spug_deploy::types::{
    BuildConfig, BuildStatus, ContainerConfig, DeployConfig, DeployRequest, DeployVariant,
    DockerImage, HostRecord, Repository, RequestKind, RequestStatus, TarballConfig,
    VersionSelector,
};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const SPUG_VERSION: &str = "9_20240101120000";

/// One scripted response: commands containing `needle` on `host_id` (or on
/// every host when `None`) exit with `code`.
pub struct Rule {
    pub host_id: Option<i64>,
    pub needle: String,
    pub code: i32,
    pub output: String,
}

impl Rule {
    pub fn host(host_id: i64, needle: &str, code: i32) -> Self {
        Self {
            host_id: Some(host_id),
            needle: needle.to_string(),
            code,
            output: String::new(),
        }
    }

    pub fn any(needle: &str, code: i32) -> Self {
        Self {
            host_id: None,
            needle: needle.to_string(),
            code,
            output: String::new(),
        }
    }
}

/// Everything the scripted sessions observed, for assertions.
#[derive(Default, Clone)]
pub struct ScriptLog {
    pub commands: Arc<Mutex<Vec<(i64, String)>>>,
    pub transfers: Arc<Mutex<Vec<(i64, String)>>>,
}

impl ScriptLog {
    pub fn commands_for(&self, host_id: i64) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| *h == host_id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }
}

pub struct ScriptedFactory {
    rules: Arc<Vec<Rule>>,
    log: ScriptLog,
}

impl ScriptedFactory {
    pub fn new(rules: Vec<Rule>) -> (Arc<Self>, ScriptLog) {
        let log = ScriptLog::default();
        let factory = Arc::new(Self {
            rules: Arc::new(rules),
            log: log.clone(),
        });
        (factory, log)
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn connect(&self, host: &HostRecord, _env: &EnvContext) -> Result<Arc<dyn RemoteSession>> {
        Ok(Arc::new(ScriptedHost {
            host_id: host.id,
            rules: self.rules.clone(),
            log: self.log.clone(),
        }))
    }
}

struct ScriptedHost {
    host_id: i64,
    rules: Arc<Vec<Rule>>,
    log: ScriptLog,
}

impl ScriptedHost {
    fn respond(&self, command: &str) -> (i32, String) {
        for rule in self.rules.iter() {
            let host_matches = rule.host_id.map_or(true, |h| h == self.host_id);
            if host_matches && command.contains(&rule.needle) {
                return (rule.code, rule.output.clone());
            }
        }
        // The existence probe answers "nothing there yet" by default.
        if command.contains("[ -e ") || command.contains("[ -d ") {
            (1, String::new())
        } else {
            (0, String::new())
        }
    }
}

#[async_trait]
impl RemoteSession for ScriptedHost {
    async fn exec_raw(&self, command: &str) -> Result<(i32, String)> {
        self.log
            .commands
            .lock()
            .unwrap()
            .push((self.host_id, command.to_string()));
        Ok(self.respond(command))
    }

    async fn exec_streamed(&self, command: &str, sink: OutputSink<'_>) -> Result<i32> {
        let (code, output) = self.exec_raw(command).await?;
        for line in output.lines() {
            sink(line);
        }
        Ok(code)
    }

    async fn put_file(&self, _local: &Path, remote: &str, progress: ProgressFn<'_>) -> Result<()> {
        self.log
            .transfers
            .lock()
            .unwrap()
            .push((self.host_id, remote.to_string()));
        progress(1024, 1024);
        Ok(())
    }
}

pub fn host(id: i64) -> HostRecord {
    HostRecord {
        id,
        name: format!("web-{id}"),
        hostname: format!("10.0.0.{id}"),
        port: 22,
        username: "deploy".into(),
    }
}

pub fn tarball_config(parallel: bool) -> DeployConfig {
    DeployConfig {
        id: 9,
        app_id: 1,
        app_name: "web".into(),
        app_key: "web".into(),
        env_id: 2,
        env_key: "prod".into(),
        is_parallel: parallel,
        build: BuildConfig {
            git_url: "git@example.com:demo/web.git".into(),
            build_host_id: 99,
            dst_repo: "/data/repos".into(),
            dst_dir: "/data/builds/web".into(),
            versions: 5,
            hook_pre_build: None,
            hook_post_build: None,
        },
        variant: DeployVariant::Tarball(TarballConfig {
            dst_dir: "/www/web".into(),
            dst_repo: "/www/repos".into(),
            versions: 5,
            hook_pre_host: Some("./deploy.sh".into()),
            hook_post_host: None,
        }),
    }
}

pub fn container_variant() -> ContainerConfig {
    ContainerConfig {
        dst_dir: "/k8s/web".into(),
        dst_repo: "/k8s/repos".into(),
        versions: 5,
        image_name: "api".into(),
        image_version: "{{IMAGE_TAG}}".into(),
        dockerfile_params: vec![],
        yaml_params: vec![("REPLICAS".into(), "3".into())],
        hook_build_image: Some("make image".into()),
        hook_push_image: Some("make push".into()),
        hook_pre_host: None,
        hook_post_host: None,
        hook_restart_host: Some("kubectl rollout restart deploy/web".into()),
    }
}

pub fn container_config(parallel: bool) -> DeployConfig {
    let mut config = tarball_config(parallel);
    config.variant = DeployVariant::Container(container_variant());
    config
}

pub fn image_record(deploy_id: i64, repository_id: Option<i64>) -> DockerImage {
    DockerImage {
        id: 0,
        app_id: 1,
        env_id: 2,
        deploy_id,
        repository_id,
        version: "v1.0".into(),
        spug_version: SPUG_VERSION.into(),
        extra: VersionSelector::Tag("v1.0".into()),
        url: String::new(),
        status: BuildStatus::NotStarted,
        remarks: "auto build".into(),
        created_at: Utc::now(),
    }
}

pub fn request(id: i64, host_ids: Vec<i64>, deploy: DeployConfig) -> DeployRequest {
    DeployRequest {
        id,
        name: format!("release {id}"),
        deploy,
        kind: RequestKind::Deploy,
        host_ids,
        fail_host_ids: Vec::new(),
        version: "v1.0".into(),
        spug_version: SPUG_VERSION.into(),
        extra: VersionSelector::Tag("v1.0".into()),
        upload_name: None,
        status: RequestStatus::Pending,
        repository_id: None,
        image_id: None,
    }
}

/// A finished source build whose tarball the hosts install; referencing it
/// from a request skips the local build stage entirely.
pub fn success_repository(backend: &MemoryBackend, deploy_id: i64) -> Repository {
    use spug_deploy::store::RepositoryStore;
    backend.repositories.save(Repository {
        id: 0,
        app_id: 1,
        env_id: 2,
        deploy_id,
        version: "v1.0".into(),
        spug_version: SPUG_VERSION.into(),
        extra: VersionSelector::Tag("v1.0".into()),
        status: BuildStatus::Success,
        remarks: "auto build".into(),
        created_at: Utc::now(),
    })
}

pub fn services_with(
    backend: &MemoryBackend,
    factory: Arc<ScriptedFactory>,
    dir: &Path,
) -> Services {
    backend.services(factory, SharedPaths::new(dir, dir))
}
