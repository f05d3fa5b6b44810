mod common;

use common::*;
use spug_deploy::dispatch;
use spug_deploy::store::{ImageStore, MemoryBackend};
use spug_deploy::types::{
    BuildStatus, ContainerConfig, DeployVariant, RegistryRecord, RequestKind, RequestStatus,
};
use tempfile::tempdir;

fn seeded_backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    for id in [1, 2] {
        backend.hosts.insert(host(id));
    }
    backend
        .configs
        .insert(1, 2, vec![("image_tag".into(), "1.0".into())]);
    backend
        .registries
        .insert(RegistryRecord::new(2, "registry.example.com", Some("team")));
    backend
}

fn published_image(backend: &MemoryBackend, repository_id: i64, url: &str) -> i64 {
    let mut image = image_record(9, Some(repository_id));
    image.status = BuildStatus::Success;
    image.url = url.into();
    backend.images.save(image).id
}

#[tokio::test]
async fn reused_image_rolls_out_without_rebuilding() {
    let (factory, log) = ScriptedFactory::new(vec![]);
    let backend = seeded_backend();
    let rep = success_repository(&backend, 9);
    let image_id = published_image(&backend, rep.id, "registry.example.com/team/api:1.0");
    let dir = tempdir().unwrap();
    let services = services_with(&backend, factory, dir.path());

    let mut req = request(7, vec![1, 2], container_config(true));
    req.repository_id = Some(rep.id);
    req.image_id = Some(image_id);

    dispatch::dispatch(&services, &mut req, false).await.unwrap();
    assert_eq!(req.status, RequestStatus::Success);
    assert!(req.fail_host_ids.is_empty());

    // No build host was touched; only the rollout hosts ran commands.
    assert!(log.commands_for(99).is_empty());
    for id in [1, 2] {
        let commands = log.commands_for(id);
        assert!(commands.iter().any(|c| c.contains("ln -sfn")));
    }
    let view = services.log.assemble("request:7", "image").unwrap();
    assert!(view.data.contains("using existing image build"));
}

#[tokio::test]
async fn drifted_image_url_fails_before_any_host_runs() {
    let (factory, log) = ScriptedFactory::new(vec![]);
    let backend = seeded_backend();
    let rep = success_repository(&backend, 9);
    let image_id = published_image(&backend, rep.id, "registry.example.com/other/api:1.0");
    let dir = tempdir().unwrap();
    let services = services_with(&backend, factory, dir.path());

    let mut req = request(8, vec![1, 2], container_config(true));
    req.repository_id = Some(rep.id);
    req.image_id = Some(image_id);

    let err = dispatch::dispatch(&services, &mut req, false)
        .await
        .unwrap_err();
    assert!(err.is_reported());
    assert_eq!(req.status, RequestStatus::Failed);
    assert_eq!(req.fail_host_ids, vec![1, 2]);
    assert!(log.commands.lock().unwrap().is_empty());
    let view = services.log.assemble("request:8", "image").unwrap();
    assert!(view.data.contains("does not match the configured target"));
}

#[tokio::test]
async fn restart_reruns_the_hook_on_every_host() {
    let (factory, log) = ScriptedFactory::new(vec![]);
    let backend = seeded_backend();
    let dir = tempdir().unwrap();
    let services = services_with(&backend, factory, dir.path());

    let mut req = request(9, vec![1, 2], container_config(false));
    req.kind = RequestKind::Restart;

    dispatch::dispatch(&services, &mut req, false).await.unwrap();
    assert_eq!(req.status, RequestStatus::Success);
    assert!(req.fail_host_ids.is_empty());
    for id in [1, 2] {
        let commands = log.commands_for(id);
        assert_eq!(commands, vec!["kubectl rollout restart deploy/web".to_string()]);
        let view = services.log.assemble("request:9", &id.to_string()).unwrap();
        assert!(view.data.contains("restart succeeded"));
    }
}

#[tokio::test]
async fn restart_without_a_hook_reports_every_host() {
    let (factory, log) = ScriptedFactory::new(vec![]);
    let backend = seeded_backend();
    let dir = tempdir().unwrap();
    let services = services_with(&backend, factory, dir.path());

    let mut deploy = container_config(false);
    if let DeployVariant::Container(ContainerConfig {
        hook_restart_host, ..
    }) = &mut deploy.variant
    {
        *hook_restart_host = None;
    }
    let mut req = request(10, vec![1, 2], deploy);
    req.kind = RequestKind::Restart;

    let err = dispatch::dispatch(&services, &mut req, false)
        .await
        .unwrap_err();
    assert!(err.is_reported());
    assert_eq!(req.status, RequestStatus::Failed);
    // A failing host does not stop the others in restart mode.
    assert_eq!(req.fail_host_ids, vec![1, 2]);
    assert!(log.commands.lock().unwrap().is_empty());
    for id in [1, 2] {
        let view = services.log.assemble("request:10", &id.to_string()).unwrap();
        assert!(view.data.contains("no restart hook configured"));
    }
}
