//! Scripted-actions deploy: a local pre-stage (server actions plus optional
//! packaging of a local directory) followed by an ordered action list
//! replayed on every host.

use crate::channel::{Helper, LOCAL_KEY};
use crate::context::EnvContext;
use crate::dispatcher;
use crate::error::{DeployError, Result};
use crate::executor::HostExecutor;
use crate::store::Services;
use crate::types::{DeployRequest, DeployVariant, FileFilter, HostAction, TransferSource};
use std::path::Path;

/// One resolved host action: paths rendered, transfer mode decided during
/// the local pre-stage.
#[derive(Debug, Clone)]
enum HostStep {
    Command {
        title: String,
        data: String,
    },
    /// Push the file uploaded at publish time directly to `dst`.
    Upload {
        title: String,
        dst: String,
        name: Option<String>,
    },
    /// Unpack the shared tarball packaged from `sp_dir/{sd_dst}` into `dst`.
    Unpack {
        title: String,
        sp_dir: String,
        sd_dst: String,
        dst: String,
    },
}

pub async fn deploy(
    services: &Services,
    helper: &Helper,
    req: &mut DeployRequest,
    env: &mut EnvContext,
    fail_mode: bool,
) -> Result<()> {
    let config = match &req.deploy.variant {
        DeployVariant::ScriptedActions(c) => c.clone(),
        _ => return Err(super::variant_mismatch()),
    };
    validate_actions(&config.host_actions)?;

    env.set("SPUG_RELEASE", req.version.clone());
    for (index, value) in req.version.split_whitespace().enumerate() {
        env.set(format!("SPUG_RELEASE_{}", index + 1), value);
    }

    // A retry run skips the local pre-stage: the server actions already ran
    // and the packaged tarball is reproduced below when needed.
    let mut step = 1u32;
    if !fail_mode {
        helper.send_info(LOCAL_KEY, "ready\r\n");
        for action in &config.server_actions {
            helper.send_step(LOCAL_KEY, step, format!("{}...\r\n", action.title));
            helper
                .local(&format!("cd /tmp && {}", action.data), Some(env))
                .await?;
            step += 1;
        }
    }

    let mut steps = Vec::with_capacity(config.host_actions.len());
    for action in &config.host_actions {
        match action {
            HostAction::Command { title, data } => steps.push(HostStep::Command {
                title: title.clone(),
                data: data.clone(),
            }),
            HostAction::Transfer {
                title,
                src,
                dst,
                source,
                filter,
            } => {
                let src = env.render(src.trim().trim_end_matches('/'))?;
                let dst = env.render(dst.trim().trim_end_matches('/'))?;
                match source {
                    TransferSource::UploadOnPublish => steps.push(HostStep::Upload {
                        title: title.clone(),
                        dst,
                        name: req.upload_name.clone(),
                    }),
                    TransferSource::Packaged => {
                        let (sp_dir, sd_dst) = split_path(&src);
                        package_source(helper, env, &src, &dst, filter, &req.spug_version)
                            .await?;
                        steps.push(HostStep::Unpack {
                            title: title.clone(),
                            sp_dir,
                            sd_dst,
                            dst,
                        });
                    }
                }
            }
        }
    }
    helper.send_step(LOCAL_KEY, 100, "");

    if steps.is_empty() {
        req.fail_host_ids.clear();
        helper.send_step(LOCAL_KEY, 100, "\r\n** deploy succeeded **");
        return Ok(());
    }

    let parallel = req.deploy.is_parallel;
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
            steps.clone(),
            deploy_id,
            spug_version.clone(),
        )
    })
    .await;
    req.fail_host_ids = fail_host_ids;
    result
}

/// The two transfer modes are mutually exclusive per deploy, and only one
/// action may package a local source; every host unpacks the same tarball.
fn validate_actions(actions: &[HostAction]) -> Result<()> {
    let mut packaged = 0;
    let mut uploads = 0;
    for action in actions {
        if let HostAction::Transfer { source, .. } = action {
            match source {
                TransferSource::Packaged => packaged += 1,
                TransferSource::UploadOnPublish => uploads += 1,
            }
        }
    }
    if packaged > 1 {
        return Err(DeployError::Validation(
            "only one transfer action may package a local source".into(),
        ));
    }
    if packaged > 0 && uploads > 0 {
        return Err(DeployError::Validation(
            "packaged and upload transfer actions cannot be mixed in one deploy".into(),
        ));
    }
    Ok(())
}

/// Package the transfer source as `{spug_version}.tar.gz` next to it. The
/// filter rules narrow what a directory source contributes.
async fn package_source(
    helper: &Helper,
    env: &EnvContext,
    src: &str,
    dst: &str,
    filter: &FileFilter,
    spug_version: &str,
) -> Result<()> {
    helper.send_step(LOCAL_KEY, 1, "packaging transfer source...\r\n");
    if src.is_empty() || dst.is_empty() {
        return Err(helper.send_error(
            LOCAL_KEY,
            format!("invalid transfer paths, src: {src:?} dst: {dst:?}"),
        ));
    }
    let metadata = tokio::fs::metadata(src)
        .await
        .map_err(|_| helper.send_error(LOCAL_KEY, format!("no such file or directory: {src}")))?;

    let (sp_dir, sd_dst) = split_path(src);
    let mut contain = sd_dst.clone();
    let mut exclude = String::new();
    if metadata.is_dir() {
        match filter {
            FileFilter::None => {}
            FileFilter::Include(rule) => {
                let files = helper.parse_filter_rule(rule, ",", env);
                if !files.is_empty() {
                    contain = files
                        .iter()
                        .map(|x| format!("{sd_dst}/{x}"))
                        .collect::<Vec<_>>()
                        .join(" ");
                }
            }
            FileFilter::Exclude(rule) => {
                let files = helper.parse_filter_rule(rule, ",", env);
                exclude = files
                    .iter()
                    .map(|x| {
                        if let Some(rooted) = x.strip_prefix('/') {
                            format!("--exclude={sd_dst}/{rooted}")
                        } else {
                            format!("--exclude={x}")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
            }
        }
    }

    let tar_gz = format!("{spug_version}.tar.gz");
    helper
        .local(
            &format!("cd {sp_dir} && tar -zcf {tar_gz} {exclude} {contain}"),
            None,
        )
        .await?;
    helper.send_info(LOCAL_KEY, "done\r\n");
    let cleanup = format!("{sp_dir}/{tar_gz}");
    helper.add_callback(move || {
        let _ = std::fs::remove_file(cleanup);
    });
    Ok(())
}

async fn deploy_host(
    services: Services,
    helper: Helper,
    h_id: i64,
    mut env: EnvContext,
    steps: Vec<HostStep>,
    deploy_id: i64,
    spug_version: String,
) -> Result<()> {
    let channel = h_id.to_string();
    helper.send_info(&channel, "ready\r\n");
    let host = services
        .hosts
        .get(h_id)
        .ok_or_else(|| helper.send_error(&channel, "no such host"))?;
    env.set("SPUG_HOST_ID", h_id.to_string());
    env.set("SPUG_HOST_NAME", host.hostname.clone());

    let session = services.sessions.connect(&host, &env).await?;
    let exec = HostExecutor::new(helper.clone(), channel.clone(), host, session);

    for (index, step) in steps.iter().enumerate() {
        let n = 1 + index as u32;
        match step {
            HostStep::Command { title, data } => {
                helper.send_step(&channel, n, format!("{title}...\r\n"));
                exec.run(&format!("cd /tmp && {data}")).await?;
            }
            HostStep::Upload { title, dst, name } => {
                helper.send_step(&channel, n, format!("{title}...\r\n"));
                // An existing directory target receives the file under its
                // original upload name.
                let code = exec
                    .probe(&format!(
                        "[ -e {dst} ] || mkdir -p $(dirname {dst}); [ -d {dst} ]"
                    ))
                    .await?;
                let target = if code == 0 {
                    let name = name
                        .as_deref()
                        .ok_or_else(|| helper.send_error(&channel, "missing upload file name"))?;
                    format!("{}/{}", dst.trim_end_matches('/'), name)
                } else {
                    dst.clone()
                };
                exec.transfer(&services.paths.published_file(deploy_id, &spug_version), &target)
                    .await
                    .map_err(|e| {
                        if e.is_reported() {
                            e
                        } else {
                            helper.send_error(&channel, format!("Exception: {e}"))
                        }
                    })?;
                helper.send_info(&channel, "transfer completed\r\n");
            }
            HostStep::Unpack {
                title,
                sp_dir,
                sd_dst,
                dst,
            } => {
                helper.send_step(&channel, n, format!("{title}...\r\n"));
                let tar_gz = format!("{spug_version}.tar.gz");
                exec.transfer(Path::new(&format!("{sp_dir}/{tar_gz}")), &format!("/tmp/{tar_gz}"))
                    .await
                    .map_err(|e| {
                        if e.is_reported() {
                            e
                        } else {
                            helper.send_error(&channel, format!("Exception: {e}"))
                        }
                    })?;
                exec.run(&format!(
                    "mkdir -p /tmp/{spug_version} && tar xf /tmp/{tar_gz} -C /tmp/{spug_version}/ \
                     && rm -rf {dst} && mv /tmp/{spug_version}/{sd_dst} {dst} \
                     && rm -rf /tmp/{spug_version}* && echo \"transfer completed\""
                ))
                .await?;
            }
        }
    }

    helper.send_step(&channel, 100, "\r\n** deploy succeeded **");
    Ok(())
}

fn split_path(path: &str) -> (String, String) {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => (".".to_string(), path.to_string()),
    }
}
