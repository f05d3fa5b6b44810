//! Tarball deploy: install the built source dir on every host behind an
//! atomic symlink, with pre/post hooks around the swap.

use crate::build::repository::{install_versioned_dir, parent_dir, InstallPlan};
use crate::channel::Helper;
use crate::context::EnvContext;
use crate::dispatcher;
use crate::error::Result;
use crate::executor::HostExecutor;
use crate::store::Services;
use crate::types::{DeployRequest, DeployVariant, RequestKind, TarballConfig};

pub async fn deploy(
    services: &Services,
    helper: &Helper,
    req: &mut DeployRequest,
    env: &mut EnvContext,
) -> Result<()> {
    let repository = super::ensure_repository(services, helper, req, env, false).await?;
    env.merge(req.extra.git_env());

    let config = match &req.deploy.variant {
        DeployVariant::Tarball(c) => c.clone(),
        _ => return Err(super::variant_mismatch()),
    };

    let parallel = req.deploy.is_parallel;
    let rollback = req.kind == RequestKind::Rollback;
    let deploy_id = req.deploy.id;
    let spug_version = repository.spug_version;
    let host_ids = req.host_ids.clone();
    let mut fail_host_ids = std::mem::take(&mut req.fail_host_ids);

    let services_outer = services.clone();
    let helper_outer = helper.clone();
    let env_outer = env.clone();
    let result = dispatcher::fan_out(helper, &host_ids, parallel, &mut fail_host_ids, move |h_id| {
        deploy_host(
            services_outer.clone(),
            helper_outer.clone(),
            h_id,
            env_outer.clone(),
            config.clone(),
            deploy_id,
            spug_version.clone(),
            rollback,
        )
    })
    .await;
    req.fail_host_ids = fail_host_ids;
    result
}

#[allow(clippy::too_many_arguments)]
async fn deploy_host(
    services: Services,
    helper: Helper,
    h_id: i64,
    mut env: EnvContext,
    config: TarballConfig,
    deploy_id: i64,
    spug_version: String,
    rollback: bool,
) -> Result<()> {
    let channel = h_id.to_string();
    helper.send_step(&channel, 1, "ready\r\npreparing data...  ");
    let host = services
        .hosts
        .get(h_id)
        .ok_or_else(|| helper.send_error(&channel, "no such host"))?;
    env.set("SPUG_HOST_ID", h_id.to_string());
    env.set("SPUG_HOST_NAME", host.hostname.clone());

    let dst_dir = env.render(&config.dst_dir)?;
    let dst_repo = env.render(&config.dst_repo)?;
    env.set("SPUG_DST_DIR", dst_dir.clone());

    let session = services.sessions.connect(&host, &env).await?;
    let exec = HostExecutor::new(helper.clone(), channel.clone(), host, session);

    if rollback {
        // Re-point the symlink at a version already present; no cleanup or
        // transfer, but the collision probe still applies.
        let base_dst_dir = parent_dir(&dst_dir);
        let code = exec
            .probe(&format!(
                "mkdir -p {dst_repo} {base_dst_dir} && [ -e {dst_dir} ] && [ ! -L {dst_dir} ]"
            ))
            .await?;
        if code == 0 {
            return Err(helper.send_error(
                &channel,
                format!(
                    "path {dst_dir:?} already exists on the host and is not a managed symlink; \
                     back it up and remove it before deploying"
                ),
            ));
        }
        helper.send_step(&channel, 1, "skipped\r\n");
    } else {
        install_versioned_dir(
            &helper,
            &exec,
            &channel,
            &InstallPlan {
                dst_dir: &dst_dir,
                dst_repo: &dst_repo,
                deploy_id,
                versions: config.versions,
                spug_version: &spug_version,
                tarball: &services.paths.tarball(&spug_version),
            },
        )
        .await?;
    }

    let repo_dir = format!("{dst_repo}/{spug_version}");
    if let Some(hook) = &config.hook_pre_host {
        helper.send_step(&channel, 2, "running pre-deploy hook...\r\n");
        exec.run(&format!("cd {repo_dir} && {hook}")).await?;
    }

    helper.send_step(&channel, 3, "switching symlink...  ");
    exec.run_quiet(&format!("rm -f {dst_dir} && ln -sfn {repo_dir} {dst_dir}"))
        .await?;
    helper.send_step(&channel, 3, "done\r\n");

    if let Some(hook) = &config.hook_post_host {
        helper.send_step(&channel, 4, "running post-deploy hook...\r\n");
        exec.run(&format!("cd {dst_dir} && {hook}")).await?;
    }

    helper.send_step(&channel, 100, "\r\n** deploy succeeded **");
    Ok(())
}
