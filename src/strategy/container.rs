//! Containerized deploy: build (or reuse) a source artifact and a container
//! image, then roll the manifest out to every host. A restart-only mode
//! re-runs the restart hook without rebuilding anything.

use crate::build::repository::parent_dir;
use crate::build::ImageBuilder;
use crate::channel::{Helper, IMAGE_KEY};
use crate::context::EnvContext;
use crate::dispatcher;
use crate::error::Result;
use crate::executor::HostExecutor;
use crate::store::Services;
use crate::types::{
    BuildStatus, ContainerConfig, DeployRequest, DeployVariant, DockerImage, RequestKind,
    TemplateKind,
};
use chrono::Utc;
use std::path::PathBuf;

pub async fn deploy(
    services: &Services,
    helper: &Helper,
    req: &mut DeployRequest,
    env: &mut EnvContext,
) -> Result<()> {
    let config = match &req.deploy.variant {
        DeployVariant::Container(c) => c.clone(),
        _ => return Err(super::variant_mismatch()),
    };

    let repository = super::ensure_repository(services, helper, req, env, true).await?;
    env.merge(req.extra.git_env());

    let builder = ImageBuilder::new(services, helper);
    let image = match req.image_id {
        Some(id) => {
            let image = services
                .images
                .get(id)
                .ok_or_else(|| helper.send_error(IMAGE_KEY, "no such image build"))?;
            // The reused image skips the build, but the per-host view still
            // needs the registry and image identity in the env.
            builder.apply_registry_env(env, req.deploy.env_id)?;
            let version = env.render_or_empty(&config.image_version);
            env.set("SPUG_IMAGE_NAME", config.image_name.clone());
            env.set("SPUG_IMAGE_VERSION", version);
            env.merge(config.dockerfile_params.iter().cloned());
            helper.send_info(
                IMAGE_KEY,
                format!(
                    "\r\nusing existing image build\r\n id: [{}]\r\n version: [{}]\r\n url: [{}]\r\n created: [{}]\r\n remarks: [{}]\r\n done\r\n",
                    image.id, image.version, image.url, image.created_at, image.remarks
                ),
            );
            image
        }
        None => {
            let image = DockerImage {
                id: 0,
                app_id: req.deploy.app_id,
                env_id: req.deploy.env_id,
                deploy_id: req.deploy.id,
                repository_id: Some(repository.id),
                version: req.version.clone(),
                spug_version: req.spug_version.clone(),
                extra: req.extra.clone(),
                url: String::new(),
                status: BuildStatus::NotStarted,
                remarks: "auto build".into(),
                created_at: Utc::now(),
            };
            let image = builder
                .dispatch(image, &repository, &config, &req.deploy.build, env)
                .await?;
            req.image_id = Some(image.id);
            image
        }
    };

    env.merge(config.yaml_params.iter().cloned());

    // The image the hosts will pull must be the one this configuration
    // resolves to; a drifted registry/name/version is fatal.
    let expected = expected_image_url(env);
    if image.url != expected {
        return Err(helper.send_error(
            IMAGE_KEY,
            format!(
                "image url {} does not match the configured target {expected}",
                image.url
            ),
        ));
    }

    let manifest = stage_manifest(services, helper, req).await?;

    let parallel = req.deploy.is_parallel;
    let rollback = req.kind == RequestKind::Rollback;
    let deploy_id = req.deploy.id;
    let spug_version = req.spug_version.clone();
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
            manifest.clone(),
            rollback,
        )
    })
    .await;
    req.fail_host_ids = fail_host_ids;
    result
}

/// Write the declared manifest template body (verbatim) under the build dir
/// so every host worker uploads the same staged file. Absence of a template
/// is a soft condition.
async fn stage_manifest(
    services: &Services,
    helper: &Helper,
    req: &DeployRequest,
) -> Result<Option<PathBuf>> {
    let Some(template) = services
        .templates
        .find(req.deploy.env_id, TemplateKind::Yaml)
    else {
        return Ok(None);
    };
    let path = services
        .paths
        .build_dir
        .join(format!("{}_{}", req.spug_version, template.name()));
    tokio::fs::write(&path, &template.body).await?;
    let cleanup = path.clone();
    helper.add_callback(move || {
        let _ = std::fs::remove_file(cleanup);
    });
    Ok(Some(path))
}

#[allow(clippy::too_many_arguments)]
async fn deploy_host(
    services: Services,
    helper: Helper,
    h_id: i64,
    mut env: EnvContext,
    config: ContainerConfig,
    deploy_id: i64,
    spug_version: String,
    manifest: Option<PathBuf>,
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

    let base_dst_dir = parent_dir(&dst_dir);
    let code = exec
        .probe(&format!(
            "mkdir -p {dst_repo} {base_dst_dir} && mkdir -p \"{dst_repo}/{spug_version}\" \
             && [ -e {dst_dir} ] && [ ! -L {dst_dir} ]"
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

    if rollback {
        helper.send_step(&channel, 1, "skipped\r\n");
    } else {
        let clean = format!(
            "ls -d {deploy_id}_* 2> /dev/null | sort -t _ -rnk2 | tail -n +{} | xargs rm -rf",
            config.versions + 1
        );
        exec.run_quiet(&format!("cd {dst_repo} && {clean}")).await?;

        match &manifest {
            Some(path) => {
                helper.send_step(&channel, 1, "writing manifest...  ");
                exec.transfer(path, &format!("{dst_repo}/{spug_version}/{}", TemplateKind::Yaml.file_name()))
                    .await
                    .map_err(|e| {
                        if e.is_reported() {
                            e
                        } else {
                            helper.send_error(&channel, format!("Exception: {e}"))
                        }
                    })?;
            }
            None => helper.send_step(&channel, 1, "no manifest template registered\r\n"),
        }
        helper.send_step(&channel, 1, "done\r\n");
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

/// Restart-only mode: walk the hosts one at a time, re-running the restart
/// hook. A failing host does not stop the others; the first error still
/// fails the request.
pub async fn restart(
    services: &Services,
    helper: &Helper,
    req: &mut DeployRequest,
    env: &mut EnvContext,
) -> Result<()> {
    let config = match &req.deploy.variant {
        DeployVariant::Container(c) => c.clone(),
        _ => return Err(super::variant_mismatch()),
    };
    env.merge(config.yaml_params.iter().cloned());

    let mut stack = req.host_ids.clone();
    stack.sort_unstable_by(|a, b| b.cmp(a));

    let mut first_error = None;
    while let Some(h_id) = stack.pop() {
        let outcome = restart_host(services, helper, h_id, env.clone(), &config).await;
        match outcome {
            Ok(()) => req.fail_host_ids.retain(|x| *x != h_id),
            Err(e) => {
                if !e.is_reported() {
                    let _ = helper.send_error(&h_id.to_string(), format!("Exception: {e}"));
                }
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn restart_host(
    services: &Services,
    helper: &Helper,
    h_id: i64,
    mut env: EnvContext,
    config: &ContainerConfig,
) -> Result<()> {
    let channel = h_id.to_string();
    helper.send_step(&channel, 1, "ready\r\npreparing data...  ");
    let host = services
        .hosts
        .get(h_id)
        .ok_or_else(|| helper.send_error(&channel, "no such host"))?;
    env.set("SPUG_HOST_ID", h_id.to_string());
    env.set("SPUG_HOST_NAME", host.hostname.clone());

    let session = services.sessions.connect(&host, &env).await?;
    let exec = HostExecutor::new(helper.clone(), channel.clone(), host, session);
    helper.send_step(&channel, 1, "done\r\n");

    let hook = config
        .hook_restart_host
        .as_ref()
        .ok_or_else(|| helper.send_error(&channel, "no restart hook configured"))?;
    helper.send_step(&channel, 4, "restarting...\r\n");
    exec.run(hook).await?;

    helper.send_step(&channel, 100, "\r\n** restart succeeded **");
    Ok(())
}

/// Image URL the hosts are configured to pull, derived from the env the
/// same way the build computed the stored URL.
fn expected_image_url(env: &EnvContext) -> String {
    let name = env.get("SPUG_IMAGE_NAME").unwrap_or_default();
    let version = env.get("SPUG_IMAGE_VERSION").unwrap_or_default();
    match env.get("SPUG_CONTAINER_REPOSITORY").filter(|r| !r.is_empty()) {
        Some(registry) => match env
            .get("SPUG_CONTAINER_REPOSITORY_NAME_PREFIX")
            .filter(|p| !p.is_empty())
        {
            Some(prefix) => format!("{registry}/{prefix}/{name}:{version}"),
            None => format!("{registry}/{name}:{version}"),
        },
        None => format!("{name}:{version}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_url_matches_registry_layout() {
        let mut env = EnvContext::new();
        env.set("SPUG_IMAGE_NAME", "api");
        env.set("SPUG_IMAGE_VERSION", "1.4");
        assert_eq!(expected_image_url(&env), "api:1.4");

        env.set("SPUG_CONTAINER_REPOSITORY", "registry.example.com");
        env.set("SPUG_CONTAINER_REPOSITORY_NAME_PREFIX", "");
        assert_eq!(expected_image_url(&env), "registry.example.com/api:1.4");

        env.set("SPUG_CONTAINER_REPOSITORY_NAME_PREFIX", "team");
        assert_eq!(expected_image_url(&env), "registry.example.com/team/api:1.4");
    }
}
