//! Container image build pipeline.
//!
//! Runs on top of a successful repository build: installs the source on the
//! image build host, writes the declared Dockerfile template, runs the
//! image-build and image-push hooks and records the resolved registry URL.

use crate::build::repository::{install_versioned_dir, InstallPlan};
use crate::channel::{Helper, IMAGE_KEY};
use crate::context::EnvContext;
use crate::error::{DeployError, Result};
use crate::executor::HostExecutor;
use crate::store::Services;
use crate::types::{
    BuildConfig, BuildStatus, ContainerConfig, DockerImage, RegistryRecord, Repository,
    TemplateKind,
};
use tracing::info;

pub struct ImageBuilder<'a> {
    services: &'a Services,
    helper: &'a Helper,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(services: &'a Services, helper: &'a Helper) -> Self {
        Self { services, helper }
    }

    /// Build the image artifact on top of `repository`. Mutates `env` with
    /// the image/registry layer so later per-host work sees the same view.
    pub async fn dispatch(
        &self,
        image: DockerImage,
        repository: &Repository,
        config: &ContainerConfig,
        build: &BuildConfig,
        env: &mut EnvContext,
    ) -> Result<DockerImage> {
        let mut image = image;
        image.status = BuildStatus::Building;
        image = self.services.images.save(image);

        let result = self.prepare_and_build(&image, repository, config, build, env).await;
        match result {
            Ok(url) => {
                image.url = url;
                image.status = BuildStatus::Success;
                let image = self.services.images.save(image);
                Ok(image)
            }
            Err(e) => {
                image.status = BuildStatus::Failed;
                self.services.images.save(image);
                Err(e)
            }
        }
    }

    async fn prepare_and_build(
        &self,
        image: &DockerImage,
        repository: &Repository,
        config: &ContainerConfig,
        build: &BuildConfig,
        env: &mut EnvContext,
    ) -> Result<String> {
        self.helper
            .send_info(IMAGE_KEY, "preparing image build...  \r\n");

        let registry = self.apply_registry_env(env, image.env_id)?;

        // The resolved configuration set also feeds standalone builds that
        // never went through a request dispatch.
        let configs = self.services.configs.resolved(image.app_id, image.env_id);
        env.merge(configs.into_iter().map(|(k, v)| (k.to_uppercase(), v)));

        let image_version = env.render_or_empty(&config.image_version);
        env.set("SPUG_IMAGE_NAME", config.image_name.clone());
        env.set("SPUG_IMAGE_VERSION", image_version.clone());
        env.merge(config.dockerfile_params.iter().cloned());

        self.guard_overwrite(image, config, &image_version)?;

        self.build_remote(image, repository, config, build, env).await?;

        let url = match &registry {
            Some(record) => record.image_url(&config.image_name, &image_version),
            None => format!("{}:{}", config.image_name, image_version),
        };
        info!(url, "image build finished");
        Ok(url)
    }

    /// Resolve the environment's registry record and layer its address into
    /// the env. No record is a soft condition (the image stays local);
    /// multiple records are fatal.
    pub(crate) fn apply_registry_env(
        &self,
        env: &mut EnvContext,
        env_id: i64,
    ) -> Result<Option<RegistryRecord>> {
        let mut records = self.services.registries.find_all(env_id);
        let record = match records.len() {
            0 => {
                self.helper.send_info(
                    IMAGE_KEY,
                    format!("no container registry configured for environment [{env_id}]\r\n"),
                );
                None
            }
            1 => records.pop(),
            n => {
                self.helper.send_info(
                    IMAGE_KEY,
                    format!("found {n} container registry records for one environment\r\n"),
                );
                return Err(DeployError::AmbiguousConfig(format!(
                    "{n} container registry records match environment {env_id}"
                )));
            }
        };
        match &record {
            Some(record) => {
                env.set("SPUG_CONTAINER_REPOSITORY", record.registry.clone());
                env.set(
                    "SPUG_CONTAINER_REPOSITORY_NAME_PREFIX",
                    record.name_prefix.clone().unwrap_or_default(),
                );
            }
            None => {
                env.set("SPUG_CONTAINER_REPOSITORY", "");
                env.set("SPUG_CONTAINER_REPOSITORY_NAME_PREFIX", "");
            }
        }
        Ok(record)
    }

    /// A version that came from a template expression must not silently
    /// replace an already-published image. Checked before any remote build
    /// step runs.
    fn guard_overwrite(
        &self,
        image: &DockerImage,
        config: &ContainerConfig,
        resolved_version: &str,
    ) -> Result<()> {
        if config.image_version == resolved_version {
            return Ok(());
        }
        self.helper.send_info(
            IMAGE_KEY,
            format!(
                "image version is dynamic: {} -> [{}]\r\n",
                config.image_version, resolved_version
            ),
        );
        if self
            .services
            .images
            .find_success(image.app_id, image.env_id, resolved_version)
            .is_some()
        {
            let name = format!("{}:{}", config.image_name, resolved_version);
            self.helper.send_info(
                IMAGE_KEY,
                format!("a published image already exists for {name}; refusing to overwrite\r\n"),
            );
            return Err(DeployError::Overwrite { image: name });
        }
        Ok(())
    }

    async fn build_remote(
        &self,
        image: &DockerImage,
        repository: &Repository,
        config: &ContainerConfig,
        build: &BuildConfig,
        env: &EnvContext,
    ) -> Result<()> {
        let mut env = env.clone();
        self.helper
            .send_step(IMAGE_KEY, 1, "preparing build host...  ");
        let host = self
            .services
            .hosts
            .get(build.build_host_id)
            .ok_or_else(|| self.helper.send_error(IMAGE_KEY, "no such image build host"))?;
        env.set("SPUG_HOST_ID", host.id.to_string());
        env.set("SPUG_HOST_NAME", host.hostname.clone());

        let dst_dir = env.render(&config.dst_dir)?;
        let dst_repo = env.render(&config.dst_repo)?;
        env.set("SPUG_DST_DIR", dst_dir.clone());

        let session = self.services.sessions.connect(&host, &env).await?;
        let exec = HostExecutor::new(self.helper.clone(), IMAGE_KEY, host, session);

        install_versioned_dir(
            self.helper,
            &exec,
            IMAGE_KEY,
            &InstallPlan {
                dst_dir: &dst_dir,
                dst_repo: &dst_repo,
                deploy_id: image.deploy_id,
                versions: config.versions,
                spug_version: &repository.spug_version,
                tarball: &self.services.paths.tarball(&repository.spug_version),
            },
        )
        .await?;

        let repo_dir = format!("{}/{}", dst_repo, repository.spug_version);
        self.write_dockerfile(image, &mut env, &exec, &repo_dir).await?;

        if let Some(hook) = &config.hook_build_image {
            self.helper
                .send_step(IMAGE_KEY, 2, "building image...\r\n");
            exec.run(&format!("cd {repo_dir} && {hook}")).await?;
        }

        self.helper.send_step(IMAGE_KEY, 3, "switching symlink...  ");
        exec.run_quiet(&format!("rm -f {dst_dir} && ln -sfn {repo_dir} {dst_dir}"))
            .await?;
        self.helper.send_step(IMAGE_KEY, 3, "done\r\n");

        if let Some(hook) = &config.hook_push_image {
            self.helper.send_step(IMAGE_KEY, 4, "pushing image...\r\n");
            exec.run(&format!("cd {dst_dir} && {hook}")).await?;
        }

        self.helper
            .send_step(IMAGE_KEY, 100, "\r\n** image built and pushed **");
        Ok(())
    }

    /// Write the declared Dockerfile body (verbatim) to the build host.
    /// Absence of a template is a soft condition: the source tree may carry
    /// its own Dockerfile.
    async fn write_dockerfile(
        &self,
        image: &DockerImage,
        env: &mut EnvContext,
        exec: &HostExecutor,
        repo_dir: &str,
    ) -> Result<()> {
        let Some(template) = self
            .services
            .templates
            .find(image.env_id, TemplateKind::Dockerfile)
        else {
            self.helper
                .send_info(IMAGE_KEY, "no dockerfile template registered\r\n");
            return Ok(());
        };
        env.merge(template.clean_parameters());

        self.helper
            .send_step(IMAGE_KEY, 1, format!("writing {} ...  ", template.name()));
        let local = self
            .services
            .paths
            .build_dir
            .join(format!("{}_{}", image.spug_version, template.name()));
        tokio::fs::write(&local, &template.body).await?;
        exec.transfer(&local, &format!("{}/{}", repo_dir, template.name()))
            .await?;
        let cleanup = local.clone();
        self.helper.add_callback(move || {
            let _ = std::fs::remove_file(cleanup);
        });
        self.helper.send_step(IMAGE_KEY, 1, "done\r\n");
        Ok(())
    }
}
