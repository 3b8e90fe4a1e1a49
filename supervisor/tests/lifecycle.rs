#![cfg(unix)]

mod common;

use std::collections::{BTreeMap, HashMap};

use common::{eventually, Sandbox, LONG_RUNNING};
use shared::{EncryptedFileSecretStore, SecretStore, SupervisorError};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_yield_one_process() {
    let sandbox = Sandbox::new();
    let supervisor = sandbox.supervisor();
    supervisor.bootstrap().await.unwrap();
    let id = supervisor.upload("Race", LONG_RUNNING.as_bytes()).unwrap();

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let supervisor = supervisor.clone();
            let id = id.clone();
            tokio::spawn(async move { supervisor.start(&id).await })
        })
        .collect();

    let mut ok = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => ok += 1,
            Err(SupervisorError::InvalidState(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(supervisor.registry().running_count(), 1);
    assert_eq!(supervisor.list_logs(&id).unwrap().len(), 1);

    supervisor.stop(&id).await.unwrap();
    assert_eq!(supervisor.registry().running_count(), 0);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let sandbox = Sandbox::new();
    let supervisor = sandbox.supervisor();
    supervisor.bootstrap().await.unwrap();
    let id = supervisor.upload("Idle", LONG_RUNNING.as_bytes()).unwrap();

    supervisor.stop(&id).await.unwrap();
    assert!(!supervisor.strategy(&id).unwrap().is_running);
    assert!(supervisor.strategy(&id).unwrap().last_stopped.is_none());

    supervisor.start(&id).await.unwrap();
    let pid = supervisor.strategy(&id).unwrap().pid.unwrap();
    assert!(common::pid_alive(pid));

    supervisor.stop(&id).await.unwrap();
    supervisor.stop(&id).await.unwrap();

    let config = supervisor.strategy(&id).unwrap();
    assert!(!config.is_running);
    assert!(config.pid.is_none());
    assert!(config.last_stopped.is_some());
    assert!(eventually(|| async move { !common::pid_alive(pid) }).await);

    assert!(matches!(
        supervisor.stop("missing").await,
        Err(SupervisorError::NotFound(_))
    ));
}

#[tokio::test]
async fn secure_env_merges_and_reaches_the_child() {
    let sandbox = Sandbox::new();
    let supervisor = sandbox.supervisor();
    supervisor.bootstrap().await.unwrap();
    let script = "echo \"A=$A B=$B PLAIN=$PLAIN\"\nwhile true; do sleep 1; done\n";
    let id = supervisor.upload("Env", script.as_bytes()).unwrap();

    let plain: BTreeMap<String, String> = [("PLAIN".to_string(), "p".to_string())].into();
    supervisor
        .set_env(&id, plain.clone(), [("A".to_string(), "1".to_string())].into())
        .unwrap();
    supervisor
        .set_env(&id, plain, [("B".to_string(), "2".to_string())].into())
        .unwrap();

    let env = supervisor.get_env(&id).unwrap();
    assert_eq!(env.secure_keys, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(env.regular.get("PLAIN").map(String::as_str), Some("p"));
    assert!(!env.read_only);

    supervisor.start(&id).await.unwrap();
    assert!(supervisor.get_env(&id).unwrap().read_only);
    assert!(matches!(
        supervisor.set_env(&id, BTreeMap::new(), HashMap::new()),
        Err(SupervisorError::InvalidState(_))
    ));

    let found = eventually(|| {
        let supervisor = supervisor.clone();
        let id = id.clone();
        async move {
            supervisor
                .read_latest_log(&id)
                .map(|log| log.content.contains("A=1 B=2 PLAIN=p"))
                .unwrap_or(false)
        }
    })
    .await;
    assert!(found);

    supervisor.stop(&id).await.unwrap();
}

#[tokio::test]
async fn readiness_gate_blocks_then_resumes() {
    let sandbox = Sandbox::new();
    sandbox.readiness.set_ready(common::BROKER, false);
    let supervisor = sandbox.supervisor();
    supervisor.bootstrap().await.unwrap();
    let id = supervisor.upload("Gated", LONG_RUNNING.as_bytes()).unwrap();

    let err = supervisor.start(&id).await.unwrap_err();
    assert!(matches!(err, SupervisorError::DependencyNotReady(_)));

    let config = supervisor.strategy(&id).unwrap();
    assert!(config.is_error);
    assert!(!config.is_running);
    assert!(config.is_waiting_for_dependency());
    assert_eq!(supervisor.registry().running_count(), 0);
    assert!(supervisor.list_logs(&id).unwrap().is_empty());

    let status = supervisor.status();
    assert!(!status.readiness.ready);
    assert_eq!(status.readiness.message, "Master contracts not ready for broker: zerodha");

    sandbox.readiness.set_ready(common::BROKER, true);
    let report = supervisor.on_session_ready().await;
    assert!(report.recovery.is_none());
    assert_eq!(report.resumed.started, vec![id.clone()]);

    let config = supervisor.strategy(&id).unwrap();
    assert!(config.is_running);
    assert!(!config.is_error);

    supervisor.stop(&id).await.unwrap();
}

#[tokio::test]
async fn upload_start_stop_delete_leaves_nothing_behind() {
    let sandbox = Sandbox::new();
    let supervisor = sandbox.supervisor();
    supervisor.bootstrap().await.unwrap();

    let id = supervisor.upload("Round Trip", LONG_RUNNING.as_bytes()).unwrap();
    assert!(id.starts_with("round_trip_"));
    supervisor
        .set_env(
            &id,
            [("X".to_string(), "1".to_string())].into(),
            [("TOKEN".to_string(), "secret".to_string())].into(),
        )
        .unwrap();
    supervisor.edit(&id, LONG_RUNNING.as_bytes()).unwrap();

    let script = supervisor.strategy(&id).unwrap().file_path;
    assert!(script.with_extension("bak").exists());

    supervisor.start(&id).await.unwrap();
    assert!(matches!(
        supervisor.edit(&id, b"echo nope\n"),
        Err(SupervisorError::InvalidState(_))
    ));
    supervisor.stop(&id).await.unwrap();

    let exported = supervisor.export(&id).unwrap();
    assert_eq!(exported.content, LONG_RUNNING.as_bytes());

    supervisor.delete(&id).await.unwrap();
    assert!(supervisor.strategies().is_empty());
    assert_eq!(supervisor.registry().running_count(), 0);
    assert!(!script.exists());
    assert!(!script.with_extension("bak").exists());

    let config = sandbox.config();
    let secrets = EncryptedFileSecretStore::open(config.secure_env_file(), config.key_file()).unwrap();
    assert!(secrets.keys(&id).is_empty());
    assert!(matches!(
        supervisor.strategy(&id),
        Err(SupervisorError::NotFound(_))
    ));
}

#[tokio::test]
async fn reaper_clears_exited_strategies() {
    let sandbox = Sandbox::new();
    let supervisor = sandbox.supervisor();
    supervisor.bootstrap().await.unwrap();
    let id = supervisor.upload("Short", b"echo done\n").unwrap();

    supervisor.start(&id).await.unwrap();
    let reaped = eventually(|| {
        let supervisor = supervisor.clone();
        async move { !supervisor.reap_dead().is_empty() }
    })
    .await;
    assert!(reaped);

    let status = supervisor.status();
    assert_eq!(status.running_count, 0);
    assert_eq!(status.total_count, 1);
    let summary = &status.strategies[0];
    assert!(!summary.is_running);
    assert!(summary.pid.is_none());
    assert!(supervisor.read_latest_log(&id).unwrap().content.contains("done"));

    let cleared = supervisor.clear_logs(&id).unwrap();
    assert_eq!(cleared.cleared_count, 1);
    assert!(supervisor.list_logs(&id).unwrap().is_empty());
}
