//! Top-level request dispatch: one run of one `DeployRequest` end to end.
//!
//! The dispatch owns the request for its duration, assembles the base
//! environment, hands off to the strategy engine and persists the outcome
//! exactly once, on every exit path.

use crate::build::{ImageBuilder, RepositoryBuilder};
use crate::channel::{Helper, LOCAL_KEY};
use crate::context::EnvContext;
use crate::error::{DeployError, Result};
use crate::store::Services;
use crate::strategy;
use crate::types::{
    BuildConfig, ContainerConfig, DeployRequest, DockerImage, Repository, RequestKind,
    RequestStatus,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Run one deploy request. With `fail_mode` the run targets exactly the
/// previous run's failure set, leaving already-successful hosts untouched.
pub async fn dispatch(services: &Services, req: &mut DeployRequest, fail_mode: bool) -> Result<()> {
    if fail_mode {
        req.host_ids = req.fail_host_ids.clone();
    }
    if req.host_ids.is_empty() {
        return Err(DeployError::Validation("request has no target hosts".into()));
    }
    req.fail_host_ids = req.host_ids.clone();

    let stream_key = format!("request:{}", req.id);
    let helper = if fail_mode {
        Helper::for_retry(services.log.clone(), &stream_key, &req.host_ids)
    } else {
        Helper::new(services.log.clone(), &stream_key)
    };

    req.status = RequestStatus::Running;
    info!(request_id = req.id, fail_mode, "dispatching deploy request");

    let result = run_request(services, &helper, req, fail_mode).await;
    match &result {
        Ok(()) => req.status = RequestStatus::Success,
        Err(e) => {
            req.status = RequestStatus::Failed;
            warn!(request_id = req.id, error = %e, "deploy request failed");
            if !e.is_reported() {
                let _ = helper.send_error(LOCAL_KEY, format!("Exception: {e}"));
            }
        }
    }

    services.requests.persist(req);
    helper.clear();
    result
}

async fn run_request(
    services: &Services,
    helper: &Helper,
    req: &mut DeployRequest,
    fail_mode: bool,
) -> Result<()> {
    let api_token = Uuid::new_v4().simple().to_string();
    services
        .tokens
        .register(&api_token, req.deploy.app_id, req.deploy.env_id);

    let mut env = EnvContext::new();
    env.merge([
        ("SPUG_APP_NAME", req.deploy.app_name.clone()),
        ("SPUG_APP_KEY", req.deploy.app_key.clone()),
        ("SPUG_APP_ID", req.deploy.app_id.to_string()),
        ("SPUG_REQUEST_ID", req.id.to_string()),
        ("SPUG_REQUEST_NAME", req.name.clone()),
        ("SPUG_DEPLOY_ID", req.deploy.id.to_string()),
        ("SPUG_ENV_ID", req.deploy.env_id.to_string()),
        ("SPUG_ENV_KEY", req.deploy.env_key.clone()),
        ("SPUG_VERSION", req.version.clone()),
        ("SPUG_BUILD_VERSION", req.spug_version.clone()),
        ("SPUG_DEPLOY_TYPE", kind_label(req.kind).to_string()),
        ("SPUG_API_TOKEN", api_token),
        (
            "SPUG_REPOS_DIR",
            services.paths.repos_dir.display().to_string(),
        ),
    ]);
    let configs = services
        .configs
        .resolved(req.deploy.app_id, req.deploy.env_id);
    env.merge(configs.into_iter().map(|(k, v)| (k.to_uppercase(), v)));

    strategy::run(services, helper, req, &mut env, fail_mode).await
}

fn kind_label(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::Deploy => "deploy",
        RequestKind::Rollback => "rollback",
        RequestKind::Restart => "restart",
    }
}

/// Build a repository artifact outside any deploy request, logging under
/// `build:{spug_version}`.
pub async fn build_repository_standalone(
    services: &Services,
    rep: Repository,
    build: &BuildConfig,
) -> Result<Repository> {
    let helper = Helper::new(services.log.clone(), format!("build:{}", rep.spug_version));
    let mut env =
        standalone_env(services, rep.app_id, rep.env_id, rep.deploy_id, &rep.spug_version);
    env.merge(rep.extra.git_env());
    let result = RepositoryBuilder::new(services, &helper)
        .dispatch(rep, build, &env)
        .await;
    helper.clear();
    result
}

/// Build and push an image artifact outside any deploy request.
pub async fn build_image_standalone(
    services: &Services,
    image: DockerImage,
    repository: &Repository,
    config: &ContainerConfig,
    build: &BuildConfig,
) -> Result<DockerImage> {
    let helper = Helper::new(services.log.clone(), format!("build:{}", image.spug_version));
    let mut env = standalone_env(
        services,
        image.app_id,
        image.env_id,
        image.deploy_id,
        &image.spug_version,
    );
    env.merge(image.extra.git_env());
    let result = ImageBuilder::new(services, &helper)
        .dispatch(image, repository, config, build, &mut env)
        .await;
    helper.clear();
    result
}

fn standalone_env(
    services: &Services,
    app_id: i64,
    env_id: i64,
    deploy_id: i64,
    spug_version: &str,
) -> EnvContext {
    let mut env = EnvContext::new();
    env.merge([
        ("SPUG_APP_ID", app_id.to_string()),
        ("SPUG_ENV_ID", env_id.to_string()),
        ("SPUG_DEPLOY_ID", deploy_id.to_string()),
        ("SPUG_BUILD_VERSION", spug_version.to_string()),
        (
            "SPUG_REPOS_DIR",
            services.paths.repos_dir.display().to_string(),
        ),
    ]);
    let configs = services.configs.resolved(app_id, env_id);
    env.merge(configs.into_iter().map(|(k, v)| (k.to_uppercase(), v)));
    env
}
