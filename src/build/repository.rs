//! Source build pipeline: checkout, package, and install a versioned build
//! dir on the build host behind an atomic symlink.
//!
//! A build is fatal to its enclosing request on any failure, unlike host
//! deploy failures which stay local to the host. Artifacts are immutable
//! once terminal and may be reused by later requests without rebuilding.

use crate::channel::{Helper, LOCAL_KEY};
use crate::context::EnvContext;
use crate::error::Result;
use crate::executor::HostExecutor;
use crate::store::Services;
use crate::types::{BuildConfig, BuildStatus, Repository, VersionSelector};
use tracing::info;

pub struct RepositoryBuilder<'a> {
    services: &'a Services,
    helper: &'a Helper,
}

impl<'a> RepositoryBuilder<'a> {
    pub fn new(services: &'a Services, helper: &'a Helper) -> Self {
        Self { services, helper }
    }

    /// Build the artifact, or reuse an existing successful one when the
    /// descriptor says so. Terminal status is persisted on every path.
    pub async fn dispatch(
        &self,
        rep: Repository,
        build: &BuildConfig,
        env: &EnvContext,
    ) -> Result<Repository> {
        if let VersionSelector::Repository { source_id, .. } = &rep.extra {
            return self.reuse(*source_id);
        }

        let mut rep = rep;
        rep.status = BuildStatus::Building;
        rep = self.services.repositories.save(rep);

        let result = self.build(&rep, build, env).await;
        rep.status = match &result {
            Ok(()) => BuildStatus::Success,
            Err(_) => BuildStatus::Failed,
        };
        let rep = self.services.repositories.save(rep);
        result.map(|()| rep)
    }

    fn reuse(&self, source_id: i64) -> Result<Repository> {
        let rep = self
            .services
            .repositories
            .get(source_id)
            .ok_or_else(|| self.helper.send_error(LOCAL_KEY, "no such repository build"))?;
        if rep.status != BuildStatus::Success {
            return Err(self.helper.send_error(
                LOCAL_KEY,
                format!("repository build {source_id} is not in success state"),
            ));
        }
        self.helper.send_info(
            LOCAL_KEY,
            format!(
                "\r\nusing existing repository build\r\n id: [{}]\r\n version: [{}]\r\n created: [{}]\r\n remarks: [{}]\r\n done\r\n",
                rep.id, rep.version, rep.created_at, rep.remarks
            ),
        );
        info!(repository_id = rep.id, "reusing repository build");
        Ok(rep)
    }

    async fn build(&self, rep: &Repository, build: &BuildConfig, env: &EnvContext) -> Result<()> {
        let mut env = env.clone();
        self.checkout_and_pack(rep, build, &env).await?;

        let host = self
            .services
            .hosts
            .get(build.build_host_id)
            .ok_or_else(|| self.helper.send_error(LOCAL_KEY, "no such build host"))?;
        env.set("SPUG_HOST_ID", host.id.to_string());
        env.set("SPUG_HOST_NAME", host.hostname.clone());

        let dst_dir = env.render(&build.dst_dir)?;
        let dst_repo = env.render(&build.dst_repo)?;
        env.set("SPUG_DST_DIR", dst_dir.clone());

        let session = self.services.sessions.connect(&host, &env).await?;
        let exec = HostExecutor::new(self.helper.clone(), LOCAL_KEY, host, session);

        install_versioned_dir(
            self.helper,
            &exec,
            LOCAL_KEY,
            &InstallPlan {
                dst_dir: &dst_dir,
                dst_repo: &dst_repo,
                deploy_id: rep.deploy_id,
                versions: build.versions,
                spug_version: &rep.spug_version,
                tarball: &self.services.paths.tarball(&rep.spug_version),
            },
        )
        .await?;

        let repo_dir = format!("{}/{}", dst_repo, rep.spug_version);
        if let Some(hook) = &build.hook_pre_build {
            self.helper
                .send_step(LOCAL_KEY, 2, "running pre-build hook...\r\n");
            exec.run(&format!("cd {repo_dir} && {hook}")).await?;
        }

        self.helper.send_step(LOCAL_KEY, 3, "switching symlink...  ");
        exec.run_quiet(&format!("rm -f {dst_dir} && ln -sfn {repo_dir} {dst_dir}"))
            .await?;
        self.helper.send_step(LOCAL_KEY, 3, "done\r\n");

        if let Some(hook) = &build.hook_post_build {
            self.helper
                .send_step(LOCAL_KEY, 4, "running post-build hook...\r\n");
            exec.run(&format!("cd {dst_dir} && {hook}")).await?;
        }

        self.helper
            .send_step(LOCAL_KEY, 100, "\r\n** build succeeded **");
        Ok(())
    }

    /// Local stage: refresh the checkout for the selected ref and package
    /// it as `{spug_version}.tar.gz` under the shared build dir. The
    /// tarball's top-level entry is the `{spug_version}` dir so remote
    /// extraction lands in place.
    async fn checkout_and_pack(
        &self,
        rep: &Repository,
        build: &BuildConfig,
        env: &EnvContext,
    ) -> Result<()> {
        let checkout = self.services.paths.checkout_dir(rep.deploy_id);
        let checkout = checkout.display();
        let repos = self.services.paths.repos_dir.display();
        let tarball = self.services.paths.tarball(&rep.spug_version);

        self.helper
            .send_step(LOCAL_KEY, 1, "checking out source...\r\n");
        self.helper
            .local(
                &format!(
                    "[ -d {checkout}/.git ] || git clone -q {} {checkout}",
                    build.git_url
                ),
                Some(env),
            )
            .await?;
        let switch = match rep.extra.origin() {
            VersionSelector::Tag(tag) => {
                format!("cd {checkout} && git fetch -q --tags --force && git checkout -q {tag}")
            }
            VersionSelector::Branch { branch, commit } => format!(
                "cd {checkout} && git fetch -q origin {branch} && git checkout -q {commit}"
            ),
            VersionSelector::Repository { .. } => unreachable!("reuse handled in dispatch"),
        };
        self.helper.local(&switch, Some(env)).await?;

        self.helper.send_step(LOCAL_KEY, 1, "packaging source...  ");
        let v = &rep.spug_version;
        self.helper
            .local(
                &format!(
                    "cd {repos} && rm -rf {v} && cp -r {} {v} && rm -rf {v}/.git \
                     && tar zcf {} {v} && rm -rf {v}",
                    rep.deploy_id,
                    tarball.display()
                ),
                Some(env),
            )
            .await?;
        self.helper.send_step(LOCAL_KEY, 1, "done\r\n");
        Ok(())
    }
}

/// Shared remote install sequence: collision probe, stale-version cleanup,
/// tarball upload and extraction.
pub(crate) struct InstallPlan<'a> {
    pub dst_dir: &'a str,
    pub dst_repo: &'a str,
    pub deploy_id: i64,
    pub versions: u32,
    pub spug_version: &'a str,
    pub tarball: &'a std::path::Path,
}

pub(crate) async fn install_versioned_dir(
    helper: &Helper,
    exec: &HostExecutor,
    channel: &str,
    plan: &InstallPlan<'_>,
) -> Result<()> {
    let base_dst_dir = parent_dir(plan.dst_dir);
    let code = exec
        .probe(&format!(
            "mkdir -p {} {} && [ -e {} ] && [ ! -L {} ]",
            plan.dst_repo, base_dst_dir, plan.dst_dir, plan.dst_dir
        ))
        .await?;
    if code == 0 {
        return Err(helper.send_error(
            channel,
            format!(
                "path {:?} already exists on the host and is not a managed symlink; \
                 back it up and remove it before deploying",
                plan.dst_dir
            ),
        ));
    }

    let clean = format!(
        "ls -d {}_* 2> /dev/null | sort -t _ -rnk2 | tail -n +{} | xargs rm -rf",
        plan.deploy_id,
        plan.versions + 1
    );
    exec.run_quiet(&format!("cd {} && {clean}", plan.dst_repo))
        .await?;

    let tar_gz = format!("{}.tar.gz", plan.spug_version);
    exec.transfer(plan.tarball, &format!("{}/{tar_gz}", plan.dst_repo))
        .await
        .map_err(|e| {
            if e.is_reported() {
                e
            } else {
                helper.send_error(channel, format!("Exception: {e}"))
            }
        })?;

    exec.run_quiet(&format!(
        "cd {} && rm -rf {} && tar xf {tar_gz} && rm -f {}_*.tar.gz",
        plan.dst_repo, plan.spug_version, plan.deploy_id
    ))
    .await?;
    helper.send_step(channel, 1, "done\r\n");
    Ok(())
}

pub(crate) fn parent_dir(path: &str) -> String {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_dir_handles_root_and_relative_paths() {
        assert_eq!(parent_dir("/data/www/app"), "/data/www");
        assert_eq!(parent_dir("/app"), "/");
        assert_eq!(parent_dir("/data/www/"), "/data");
        assert_eq!(parent_dir("app"), ".");
    }
}
