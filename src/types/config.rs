use serde::{Deserialize, Serialize};

/// Resolved deploy-configuration record for one (application, environment)
/// pair. Owned by the external management layer; the dispatch pipeline only
/// reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub id: i64,
    pub app_id: i64,
    pub app_name: String,
    pub app_key: String,
    pub env_id: i64,
    pub env_key: String,
    pub is_parallel: bool,
    pub build: BuildConfig,
    pub variant: DeployVariant,
}

/// Parameters for the source build stage shared by the tarball and
/// containerized variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub git_url: String,
    pub build_host_id: i64,
    /// Version store on the build host, parent of `{spug_version}` dirs.
    pub dst_repo: String,
    /// Stable path switched with an atomic symlink swap.
    pub dst_dir: String,
    /// Number of build dirs retained by stale-version cleanup.
    pub versions: u32,
    #[serde(default)]
    pub hook_pre_build: Option<String>,
    #[serde(default)]
    pub hook_post_build: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeployVariant {
    Tarball(TarballConfig),
    ScriptedActions(ActionsConfig),
    Container(ContainerConfig),
}

/// Variant 1: upload the built tarball to every host and swap the symlink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TarballConfig {
    pub dst_dir: String,
    pub dst_repo: String,
    pub versions: u32,
    #[serde(default)]
    pub hook_pre_host: Option<String>,
    #[serde(default)]
    pub hook_post_host: Option<String>,
}

/// Variant 2: a local pre-stage plus an ordered action list replayed on
/// every host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsConfig {
    #[serde(default)]
    pub server_actions: Vec<ServerAction>,
    #[serde(default)]
    pub host_actions: Vec<HostAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerAction {
    pub title: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostAction {
    Command {
        title: String,
        data: String,
    },
    Transfer {
        title: String,
        src: String,
        dst: String,
        #[serde(default)]
        source: TransferSource,
        #[serde(default)]
        filter: FileFilter,
    },
}

/// Where a transfer action takes its payload from. The two modes are
/// mutually exclusive per deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferSource {
    /// Unpack the shared tarball packaged during the local pre-stage.
    #[default]
    Packaged,
    /// Push the file uploaded when the request was published.
    UploadOnPublish,
}

/// Directory inclusion/exclusion for the local packaging step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "rule", rename_all = "snake_case")]
pub enum FileFilter {
    #[default]
    None,
    Include(String),
    Exclude(String),
}

/// Variant 3: build and push a container image, then roll manifests out to
/// the hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub dst_dir: String,
    pub dst_repo: String,
    pub versions: u32,
    pub image_name: String,
    /// May contain template expressions; resolved against the deploy env.
    pub image_version: String,
    #[serde(default)]
    pub dockerfile_params: Vec<(String, String)>,
    #[serde(default)]
    pub yaml_params: Vec<(String, String)>,
    #[serde(default)]
    pub hook_build_image: Option<String>,
    #[serde(default)]
    pub hook_push_image: Option<String>,
    #[serde(default)]
    pub hook_pre_host: Option<String>,
    #[serde(default)]
    pub hook_post_host: Option<String>,
    #[serde(default)]
    pub hook_restart_host: Option<String>,
}

/// Host connection record, borrowed from the external host registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: i64,
    pub name: String,
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
}

fn default_ssh_port() -> u16 {
    22
}

/// Container registry endpoint for one environment. Address and prefix are
/// stored slash-trimmed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub env_id: i64,
    pub registry: String,
    #[serde(default)]
    pub name_prefix: Option<String>,
}

impl RegistryRecord {
    pub fn new(env_id: i64, registry: &str, name_prefix: Option<&str>) -> Self {
        Self {
            env_id,
            registry: registry.trim_matches('/').to_string(),
            name_prefix: name_prefix
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        }
    }

    /// `registry/prefix/name:version`, prefix omitted when unset.
    pub fn image_url(&self, name: &str, version: &str) -> String {
        match &self.name_prefix {
            Some(prefix) => format!("{}/{}/{}:{}", self.registry, prefix, name, version),
            None => format!("{}/{}:{}", self.registry, name, version),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    Dockerfile,
    Yaml,
}

impl TemplateKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            TemplateKind::Dockerfile => "Dockerfile",
            TemplateKind::Yaml => "k8s.yaml",
        }
    }
}

/// Named file template declared per (environment, type). The body is
/// consumed verbatim; parameters are layered into the deploy env.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTemplate {
    pub env_id: i64,
    pub kind: TemplateKind,
    pub body: String,
    #[serde(default)]
    pub parameters: Vec<(String, String)>,
}

impl FileTemplate {
    pub fn name(&self) -> &'static str {
        self.kind.file_name()
    }

    /// Parameter pairs with whitespace-trimmed keys and values.
    pub fn clean_parameters(&self) -> Vec<(String, String)> {
        self.parameters
            .iter()
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect()
    }
}
