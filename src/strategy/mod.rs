//! Deploy strategy engine.
//!
//! Three variants share the same shape: assemble the environment, ensure
//! build artifacts exist, then fan out to the hosts. Build failures are
//! fatal to the request; host failures stay in the failure set.

pub mod actions;
pub mod container;
pub mod tarball;

use crate::build::RepositoryBuilder;
use crate::channel::{Helper, LOCAL_KEY};
use crate::context::EnvContext;
use crate::error::{DeployError, Result};
use crate::store::Services;
use crate::types::{BuildStatus, DeployRequest, DeployVariant, Repository, RequestKind};
use chrono::Utc;

/// Run the variant selected by the request's deploy configuration.
pub async fn run(
    services: &Services,
    helper: &Helper,
    req: &mut DeployRequest,
    env: &mut EnvContext,
    fail_mode: bool,
) -> Result<()> {
    match &req.deploy.variant {
        DeployVariant::Tarball(_) => tarball::deploy(services, helper, req, env).await,
        DeployVariant::ScriptedActions(_) => {
            actions::deploy(services, helper, req, env, fail_mode).await
        }
        DeployVariant::Container(_) => {
            if req.kind == RequestKind::Restart {
                container::restart(services, helper, req, env).await
            } else {
                container::deploy(services, helper, req, env).await
            }
        }
    }
}

/// Ensure the request has a repository artifact, building one when the
/// request does not yet reference any. The returned record's
/// `spug_version` names the build dir present on the hosts' version store.
pub(crate) async fn ensure_repository(
    services: &Services,
    helper: &Helper,
    req: &mut DeployRequest,
    env: &EnvContext,
    log_reuse: bool,
) -> Result<Repository> {
    if let Some(id) = req.repository_id {
        let rep = services
            .repositories
            .get(id)
            .ok_or_else(|| helper.send_error(LOCAL_KEY, "no such repository build"))?;
        if log_reuse {
            helper.send_info(
                LOCAL_KEY,
                format!(
                    "\r\nusing existing repository build\r\n id: [{}]\r\n version: [{}]\r\n created: [{}]\r\n remarks: [{}]\r\n done\r\n",
                    rep.id, rep.version, rep.created_at, rep.remarks
                ),
            );
        }
        return Ok(rep);
    }

    let rep = Repository {
        id: 0,
        app_id: req.deploy.app_id,
        env_id: req.deploy.env_id,
        deploy_id: req.deploy.id,
        version: req.version.clone(),
        spug_version: req.spug_version.clone(),
        extra: req.extra.clone(),
        status: BuildStatus::NotStarted,
        remarks: "auto build".into(),
        created_at: Utc::now(),
    };
    let rep = RepositoryBuilder::new(services, helper)
        .dispatch(rep, &req.deploy.build, env)
        .await?;
    req.repository_id = Some(rep.id);
    Ok(rep)
}

pub(crate) fn variant_mismatch() -> DeployError {
    DeployError::Validation("deploy variant does not match the request kind".into())
}
