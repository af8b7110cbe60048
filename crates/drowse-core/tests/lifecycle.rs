//! Lifecycle flows against fake backends.

mod common;

use common::Harness;
use drowse_core::state::StateLock;
use drowse_core::{CoreError, NewEnvironment, PortMapping, Status, VmEnsure};
use drowse_vm::{LiveStatus, VmConfig, VmSupervisor};
use std::time::Duration;

async fn harness_with_vm() -> Harness {
    let h = Harness::new(LiveStatus::Unknown);
    h.lifecycle.create_vm(&VmConfig::default()).await.unwrap();
    h
}

async fn create(h: &Harness, name: &str, ports: &[&str]) -> drowse_core::EnvironmentRecord {
    let mut new = NewEnvironment::new(name, "ubuntu:24.04", h.project(name));
    new.ports = ports.iter().map(|p| p.parse::<PortMapping>().unwrap()).collect();
    h.lifecycle.create_environment(new).await.unwrap()
}

#[tokio::test]
async fn test_ensure_vm_without_record_is_not_found() {
    let h = Harness::new(LiveStatus::Unknown);
    let err = h.lifecycle.ensure_vm_running().await.unwrap_err();
    assert!(matches!(err, CoreError::VmNotFound));
    assert!(err.hint().unwrap().contains("drowse vm up"));
    assert_eq!(h.supervisor.starts(), 0);
}

#[tokio::test]
async fn test_create_vm_records_running() {
    let h = harness_with_vm().await;
    let vm = h.store().read_only().unwrap().document.vm().cloned().unwrap();
    assert_eq!(vm.status, Status::Running);
    assert_eq!(vm.cpus, 4);
    assert_eq!(vm.last_active, common::t0());
    assert_eq!(h.supervisor.starts(), 1);
}

#[tokio::test]
async fn test_ensure_vm_already_running() {
    let h = harness_with_vm().await;
    let outcome = h.lifecycle.ensure_vm_running().await.unwrap();
    assert_eq!(outcome, VmEnsure::AlreadyRunning);
    assert_eq!(h.supervisor.starts(), 1);
}

#[tokio::test]
async fn test_ensure_vm_stale_running_restarts() {
    let h = harness_with_vm().await;
    // The VM died behind our back.
    *h.supervisor.status.lock().unwrap() = LiveStatus::Stopped;
    h.clock.advance(Duration::from_secs(60));

    let outcome = h.lifecycle.ensure_vm_running().await.unwrap();
    assert_eq!(outcome, VmEnsure::Started);
    assert_eq!(h.supervisor.starts(), 2);

    let vm = h.store().read_only().unwrap().document.vm().cloned().unwrap();
    assert_eq!(vm.status, Status::Running);
    assert_eq!(vm.last_active, common::t0() + chrono::Duration::seconds(60));
}

#[tokio::test]
async fn test_ensure_vm_stopped_starts_it() {
    let h = harness_with_vm().await;
    h.lifecycle.stop_vm().await.unwrap();
    assert_eq!(
        h.store().read_only().unwrap().document.vm().unwrap().status,
        Status::Stopped
    );

    let outcome = h.lifecycle.ensure_vm_running().await.unwrap();
    assert_eq!(outcome, VmEnsure::Started);
    assert_eq!(h.supervisor.live_status().await.unwrap(), LiveStatus::Running);
}

#[tokio::test]
async fn test_create_environment_requires_running_vm() {
    let h = Harness::new(LiveStatus::Unknown);
    let new = NewEnvironment::new("dev", "ubuntu:24.04", h.project("dev"));
    let err = h.lifecycle.create_environment(new).await.unwrap_err();
    assert!(matches!(err, CoreError::VmNotFound));

    let h = harness_with_vm().await;
    h.lifecycle.stop_vm().await.unwrap();
    let new = NewEnvironment::new("dev", "ubuntu:24.04", h.project("dev"));
    let err = h.lifecycle.create_environment(new).await.unwrap_err();
    assert!(matches!(err, CoreError::VmNotRunning));
}

#[tokio::test]
async fn test_create_environment_launches_and_records() {
    let h = harness_with_vm().await;
    let record = create(&h, "dev", &["3000", "8080:80"]).await;

    assert_eq!(record.status, Status::Running);
    assert_eq!(record.project_path, h.project("dev").canonicalize().unwrap());
    assert_eq!(record.ports.len(), 2);

    let launched = h.runtime.launched.lock().unwrap().clone();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].name, "dev");
    assert_eq!(launched[0].workdir, "/workspace");
    assert!(launched[0].ports.iter().any(|p| p.host_port == 8080 && p.container_port == 80));

    let doc = h.store().read_only().unwrap().document;
    assert_eq!(doc.port_owner(3000), Some("dev"));
    assert_eq!(doc.port_owner(8080), Some("dev"));
    assert_eq!(doc.environment("dev").unwrap(), &record);
}

#[tokio::test]
async fn test_port_collision_between_environments() {
    let h = harness_with_vm().await;
    let a = create(&h, "a", &["8080"]).await;
    let b = create(&h, "b", &["8080"]).await;

    assert_eq!(a.ports[0].host_port, 8080);
    assert_eq!(b.ports[0].host_port, 51000);
    assert_eq!(b.ports[0].container_port, 8080);

    let doc = h.store().read_only().unwrap().document;
    assert_eq!(doc.ports.next_ephemeral, 51001);
}

#[tokio::test]
async fn test_duplicate_name_and_project_rejected() {
    let h = harness_with_vm().await;
    create(&h, "dev", &[]).await;

    let again = NewEnvironment::new("dev", "ubuntu:24.04", h.project("other"));
    let err = h.lifecycle.create_environment(again).await.unwrap_err();
    assert!(matches!(err, CoreError::EnvironmentExists(_)));

    let same_dir = NewEnvironment::new("dev2", "ubuntu:24.04", h.project("dev"));
    let err = h.lifecycle.create_environment(same_dir).await.unwrap_err();
    match err {
        CoreError::ProjectAlreadyTracked { existing, .. } => assert_eq!(existing, "dev"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_failed_launch_releases_ports() {
    let h = harness_with_vm().await;
    *h.runtime.fail_run.lock().unwrap() = true;

    let mut new = NewEnvironment::new("dev", "nope:latest", h.project("dev"));
    new.ports = vec![PortMapping::same(3000)];
    let err = h.lifecycle.create_environment(new).await.unwrap_err();
    assert!(matches!(err, CoreError::Backend(_)));

    let doc = h.store().read_only().unwrap().document;
    assert!(doc.environment("dev").is_none());
    assert!(doc.port_owner(3000).is_none());
}

#[tokio::test]
async fn test_stopped_environment_is_not_restarted() {
    let h = harness_with_vm().await;
    create(&h, "dev", &[]).await;
    assert!(!h.lifecycle.ensure_environment_running("dev").await.unwrap());

    h.lifecycle.stop_environment("dev").await.unwrap();
    let err = h
        .lifecycle
        .ensure_environment_running("dev")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::EnvironmentStopped(_)));
    let hint = err.hint().unwrap();
    assert!(hint.contains("drowse rm dev --force"));
    assert!(hint.contains("podman start dev"));

    let err = h
        .lifecycle
        .ensure_environment_running("ghost")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_stop_missing_container_marks_stopped() {
    let h = harness_with_vm().await;
    create(&h, "dev", &[]).await;
    // Someone deleted the container by hand.
    h.runtime.known.lock().unwrap().clear();
    h.runtime.running.lock().unwrap().clear();

    h.lifecycle.stop_environment("dev").await.unwrap();
    let doc = h.store().read_only().unwrap().document;
    assert_eq!(doc.environment("dev").unwrap().status, Status::Stopped);
}

#[tokio::test]
async fn test_remove_environment_releases_ports() {
    let h = harness_with_vm().await;
    create(&h, "dev", &["3000", "5432"]).await;

    let removed = h.lifecycle.remove_environment("dev", true).await.unwrap();
    assert_eq!(removed.name, "dev");

    let doc = h.store().read_only().unwrap().document;
    assert!(doc.environment("dev").is_none());
    assert!(doc.port_owner(3000).is_none());
    assert!(doc.port_owner(5432).is_none());

    let err = h.lifecycle.remove_environment("dev", true).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_run_touches_activity() {
    let h = harness_with_vm().await;
    create(&h, "dev", &[]).await;
    h.clock.advance(Duration::from_secs(600));

    let argv = vec!["echo".to_string(), "hi".to_string()];
    let output = h.lifecycle.run_in_environment("dev", &argv).await.unwrap();
    assert!(output.success());

    let doc = h.store().read_only().unwrap().document;
    let expected = common::t0() + chrono::Duration::seconds(600);
    assert_eq!(doc.environment("dev").unwrap().last_active, expected);
    assert_eq!(doc.vm().unwrap().last_active, expected);
    assert_eq!(h.runtime.execs.lock().unwrap()[0], ("dev".to_string(), argv));
}

#[tokio::test]
async fn test_run_in_vanished_container_fails() {
    let h = harness_with_vm().await;
    create(&h, "dev", &[]).await;
    h.runtime.running.lock().unwrap().clear();

    let err = h
        .lifecycle
        .run_in_environment("dev", &["true".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ContainerMissing(_)));
}

#[tokio::test]
async fn test_enter_defaults_to_bash() {
    let h = harness_with_vm().await;
    create(&h, "dev", &[]).await;
    let code = h.lifecycle.enter_environment("dev", None).await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(h.runtime.execs.lock().unwrap()[0].1, vec!["bash".to_string()]);
}

#[tokio::test]
async fn test_stop_vm_marks_environments_stopped() {
    let h = harness_with_vm().await;
    create(&h, "dev", &[]).await;
    h.lifecycle.stop_vm().await.unwrap();

    let doc = h.store().read_only().unwrap().document;
    assert_eq!(doc.vm().unwrap().status, Status::Stopped);
    assert_eq!(doc.environment("dev").unwrap().status, Status::Stopped);
    assert_eq!(h.supervisor.stops(), 1);
}

fn new_env(h: &Harness, name: &str, project: &str, ports: &[u16]) -> NewEnvironment {
    let mut new = NewEnvironment::new(name, "ubuntu:24.04", h.project(project));
    new.ports = ports.iter().copied().map(PortMapping::same).collect();
    new
}

#[tokio::test]
async fn test_overlapping_creates_keep_port_reservations() {
    let h = harness_with_vm().await;
    let gate = h.runtime.hold_next_run();

    let first = new_env(&h, "dev", "dev", &[3000]);
    let second = new_env(&h, "dev", "dev-copy", &[3000]);
    let (first, second) = tokio::join!(h.lifecycle.create_environment(first), async {
        h.runtime.run_parked.notified().await;
        let result = h.lifecycle.create_environment(second).await;
        gate.notify_one();
        result
    });

    let record = first.unwrap();
    assert_eq!(record.ports[0].host_port, 3000);
    assert!(matches!(second, Err(CoreError::Backend(_))));

    let doc = h.store().read_only().unwrap().document;
    assert_eq!(doc.port_owner(3000), Some("dev"));
    assert_eq!(doc.port_owner(51000), None);
    assert_eq!(doc.environment("dev").unwrap().ports, record.ports);

    let web = create(&h, "web", &["3000"]).await;
    assert_ne!(web.ports[0].host_port, 3000);
}

#[tokio::test]
async fn test_create_commit_waits_for_lock() {
    let h = harness_with_vm().await;
    let gate = h.runtime.hold_next_run();
    let lock_file = h.store().paths().lock_file.clone();

    let new = new_env(&h, "dev", "dev", &[3000]);
    let (result, ()) = tokio::join!(h.lifecycle.create_environment(new), async {
        h.runtime.run_parked.notified().await;
        let held = StateLock::try_acquire(&lock_file).unwrap();
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(held);
    });

    result.unwrap();
    let doc = h.store().read_only().unwrap().document;
    assert_eq!(doc.environment("dev").unwrap().status, Status::Running);
    assert_eq!(doc.port_owner(3000), Some("dev"));
}

#[tokio::test(start_paused = true)]
async fn test_create_commit_gives_up_and_removes_container() {
    let h = harness_with_vm().await;
    let gate = h.runtime.hold_next_run();
    let lock_file = h.store().paths().lock_file.clone();

    let new = new_env(&h, "dev", "dev", &[]);
    let (result, held) = tokio::join!(h.lifecycle.create_environment(new), async {
        h.runtime.run_parked.notified().await;
        let held = StateLock::try_acquire(&lock_file).unwrap();
        gate.notify_one();
        held
    });

    assert!(result.unwrap_err().is_busy());
    assert!(!h.runtime.knows("dev"));
    drop(held);

    let doc = h.store().read_only().unwrap().document;
    assert!(doc.environment("dev").is_none());
    // The name is free again.
    create(&h, "dev", &[]).await;
}
