//! Integration tests for bot admission.
//!
//! A rejected bot must produce exactly one error event and a terminal
//! status, and must never hold a worker.

mod common;

use std::time::Duration;

use arena_sandbox::{
    BotRegistry, BotRequest, EventKind, LifecycleState, SandboxConfig, SandboxError,
    SandboxManager, ScriptSource,
};
use common::*;

fn config(max_workers: usize) -> SandboxConfig {
    SandboxConfig {
        max_workers,
        setup_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn wait_for_workers(manager: &SandboxManager, n: usize) {
    tokio::time::timeout(EVENT_WAIT, async {
        while manager.active_workers() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker count did not settle");
}

fn assert_single_rejection(events: &[arena_sandbox::SandboxEvent]) {
    assert_eq!(events.len(), 2, "{events:?}");
    assert!(matches!(
        events[0].kind,
        EventKind::Error { fatal: true, .. }
    ));
    assert!(events[1].is_terminated());
}

#[tokio::test]
async fn worker_cap_rejects_without_consuming_a_worker() {
    let (manager, mut events) = SandboxManager::new(config(1));
    let first = manager
        .spawn(request("one", "setInterval(() => {}, 1000);", NO_ENDPOINT))
        .await
        .unwrap();
    until_state(&mut events, "one", LifecycleState::Running).await;
    assert_eq!(manager.active_workers(), 1);

    let err = manager
        .spawn(request("two", "setInterval(() => {}, 1000);", NO_ENDPOINT))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::WorkerLimit { max: 1 }));
    assert!(err.is_admission());
    assert_eq!(manager.active_workers(), 1);
    assert_single_rejection(&until_terminated(&mut events, "two").await);

    first.stop();
    first.terminated().await;
    wait_for_workers(&manager, 0).await;

    let second = manager
        .spawn(request("two", "setInterval(() => {}, 1000);", NO_ENDPOINT))
        .await
        .unwrap();
    until_state(&mut events, "two", LifecycleState::Running).await;
    second.stop();
    second.terminated().await;
}

#[tokio::test]
async fn denied_source_never_starts_an_isolate() {
    let (manager, mut events) = SandboxManager::new(config(4));
    let err = manager
        .spawn(request(
            "sneaky",
            "const f = eval; f('1 + 1');",
            NO_ENDPOINT,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::PolicyDenied { ref token } if token == "eval"));
    assert_eq!(manager.active_workers(), 0);

    let seen = until_terminated(&mut events, "sneaky").await;
    assert_single_rejection(&seen);
    assert!(!states(&seen).contains(&LifecycleState::Created));
}

#[tokio::test]
async fn oversized_and_empty_sources_are_rejected() {
    let config = SandboxConfig {
        max_source_size: 64,
        ..config(4)
    };
    let (manager, mut events) = SandboxManager::new(config);

    let big = format!("// {}", "x".repeat(100));
    let err = manager
        .spawn(request("big", &big, NO_ENDPOINT))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::SourceTooLarge { max: 64, .. }));
    assert_single_rejection(&until_terminated(&mut events, "big").await);

    let err = manager
        .spawn(request("blank", "   \n", NO_ENDPOINT))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::InvalidSource { .. }));
    assert_single_rejection(&until_terminated(&mut events, "blank").await);
    assert_eq!(manager.active_workers(), 0);
}

#[tokio::test]
async fn missing_script_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, mut events) = SandboxManager::new(config(4));
    let err = manager
        .spawn(BotRequest {
            bot_id: "ghost".into(),
            source: ScriptSource::Path(dir.path().join("missing.js")),
            endpoint: NO_ENDPOINT.into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::SourceUnavailable { .. }));
    assert_single_rejection(&until_terminated(&mut events, "ghost").await);
}

struct DirRegistry(std::path::PathBuf);

#[async_trait::async_trait]
impl BotRegistry for DirRegistry {
    async fn lookup(&self, bot_id: &str) -> Result<BotRequest, SandboxError> {
        let path = self.0.join(format!("{bot_id}.js"));
        if !path.exists() {
            return Err(SandboxError::UnknownBot(bot_id.to_string()));
        }
        Ok(BotRequest {
            bot_id: bot_id.to_string(),
            source: ScriptSource::Path(path),
            endpoint: NO_ENDPOINT.into(),
        })
    }
}

#[tokio::test]
async fn registry_bots_load_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("judy.js"), r#"console.log("from disk");"#).unwrap();
    let registry = DirRegistry(dir.path().to_path_buf());
    let (manager, mut events) = SandboxManager::new(config(4));

    let handle = manager.spawn_from(&registry, "judy").await.unwrap();
    until_log(&mut events, "judy", "from disk").await;
    handle.stop();
    handle.terminated().await;

    let err = manager.spawn_from(&registry, "nobody").await.unwrap_err();
    assert!(matches!(err, SandboxError::UnknownBot(_)));
    assert_single_rejection(&until_terminated(&mut events, "nobody").await);
}
