//! End-to-end behavior of the offline queue against scripted transports.

use std::sync::Arc;
use std::time::Duration;

use deferq_common::{ActionId, Error};
use deferq_storage::{KeyValueStore, LocalStore, MemoryStore};
use deferq_sync::{
    LifecycleState, Resolution, Scripted, ScriptedTransport, SyncConfig, SyncEngine, SyncEvent,
};
use proptest::prelude::*;
use serde_json::{json, Value};

fn config() -> SyncConfig {
    SyncConfig {
        max_retries: 0,
        ..Default::default()
    }
}

async fn open(
    store: Arc<dyn KeyValueStore>,
    transport: ScriptedTransport,
) -> Arc<SyncEngine<ScriptedTransport>> {
    Arc::new(SyncEngine::open(store, transport, config()).await.unwrap())
}

#[tokio::test]
async fn offline_capture_then_reconcile() {
    let engine = open(Arc::new(MemoryStore::new()), ScriptedTransport::new()).await;

    let a1 = engine
        .capture("enroll.student", json!({"name": "Ada"}))
        .await
        .unwrap();
    let a2 = engine
        .capture("grade.update", json!({"grade": "A"}))
        .await
        .unwrap();
    let a3 = engine
        .capture("payment.create", json!({"amount": 120}))
        .await
        .unwrap();
    assert_eq!(engine.queue_len().await, 3);

    engine
        .transport()
        .script(&a2.id, [Scripted::conflict()])
        .unwrap();
    let transition = engine.set_online(true).await.unwrap();
    assert!(engine.connectivity().is_online());

    let result = transition.replay.unwrap().await.unwrap().unwrap();
    assert_eq!(result.succeeded, vec![a1.id, a3.id]);
    assert_eq!(result.conflicted.len(), 1);
    let conflict = &result.conflicted[0];
    assert_eq!(conflict.id, a2.id);
    assert_eq!(conflict.local_version, 1);
    assert_eq!(conflict.remote_version, 2);
    assert_eq!(conflict.entity_type, "grade");
    assert_eq!(engine.queue_len().await, 1);

    let resolved = engine
        .resolve(&a2.id, Resolution::AcceptRemote)
        .await
        .unwrap();
    assert_eq!(resolved.resolution, Resolution::AcceptRemote);
    assert_eq!(engine.queue_len().await, 0);
    assert!(engine.conflicts().await.is_empty());
}

#[tokio::test]
async fn replay_preserves_capture_order() {
    let engine = open(Arc::new(MemoryStore::new()), ScriptedTransport::new()).await;

    let mut ids = Vec::new();
    for i in 0..10 {
        let action = engine
            .capture(&format!("task.step{}", i), json!({"step": i}))
            .await
            .unwrap();
        ids.push(action.id);
    }

    let result = engine.replay().await.unwrap();
    assert_eq!(result.succeeded, ids);
    assert_eq!(engine.transport().attempts(), ids);
}

#[tokio::test]
async fn partial_failure_is_isolated() {
    let engine = open(Arc::new(MemoryStore::new()), ScriptedTransport::new()).await;
    let a1 = engine.capture("a", Value::Null).await.unwrap();
    let a2 = engine.capture("b", Value::Null).await.unwrap();
    let a3 = engine.capture("c", Value::Null).await.unwrap();
    engine
        .transport()
        .script(&a2.id, [Scripted::Fail("gateway timeout".to_string())])
        .unwrap();

    let result = engine.replay().await.unwrap();

    assert_eq!(result.succeeded, vec![a1.id, a3.id]);
    assert_eq!(result.failed, vec![a2.id.clone()]);
    assert!(result.conflicted.is_empty());
    assert_eq!(result.remaining, 1);

    let queued = engine.queue_snapshot().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, a2.id);
    assert_eq!(queued[0].lifecycle_state, LifecycleState::Failed);
}

#[tokio::test]
async fn every_conflict_pairs_with_a_queued_action() {
    let transport = ScriptedTransport::with_default(Scripted::Conflict {
        remote_version: Some(9),
        remote_data: json!({"source": "remote"}),
    });
    let engine = open(Arc::new(MemoryStore::new()), transport).await;
    for i in 0..4 {
        engine.capture(&format!("doc.edit{}", i), Value::Null).await.unwrap();
    }

    engine.replay().await.unwrap();

    let queued: Vec<ActionId> = engine
        .queue_snapshot()
        .await
        .into_iter()
        .map(|a| a.id)
        .collect();
    let conflicts = engine.conflicts().await;
    assert_eq!(conflicts.len(), 4);
    for conflict in &conflicts {
        assert!(queued.contains(&conflict.id));
        assert_eq!(conflict.remote_version, 9);
    }

    engine
        .resolve(&conflicts[0].id, Resolution::KeepLocal)
        .await
        .unwrap();
    let result = engine
        .resolve(&conflicts[0].id, Resolution::KeepLocal)
        .await;
    assert!(matches!(result, Err(Error::UnknownConflict(_))));
    assert_eq!(engine.queue_len().await, 3);
}

#[tokio::test]
async fn empty_replay_is_idempotent() {
    let engine = open(Arc::new(MemoryStore::new()), ScriptedTransport::new()).await;

    for _ in 0..3 {
        let result = engine.replay().await.unwrap();
        assert_eq!(result.remaining, 0);
        assert!(result.conflicted.is_empty());
    }
    assert!(engine.transport().attempts().is_empty());
}

#[tokio::test]
async fn purge_discards_everything() {
    let transport = ScriptedTransport::with_default(Scripted::conflict());
    let engine = open(Arc::new(MemoryStore::new()), transport).await;
    engine.capture("a", Value::Null).await.unwrap();
    engine.replay().await.unwrap();
    engine.capture("b", Value::Null).await.unwrap();

    engine.purge().await.unwrap();

    assert_eq!(engine.queue_len().await, 0);
    assert!(engine.conflicts().await.is_empty());
    assert_eq!(engine.replay().await.unwrap().remaining, 0);
}

#[tokio::test]
async fn queue_and_conflicts_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn KeyValueStore> = Arc::new(LocalStore::new(dir.path()).unwrap());

    let conflicted = {
        let engine = open(store.clone(), ScriptedTransport::new()).await;
        let a1 = engine.capture("grade.update", json!({"grade": "B"})).await.unwrap();
        engine.capture("note.add", json!({"text": "hi"})).await.unwrap();
        engine
            .transport()
            .script(&a1.id, [Scripted::conflict()])
            .unwrap();
        engine
            .transport()
            .script(
                &engine.queue_snapshot().await[1].id,
                [Scripted::Fail("down".to_string())],
            )
            .unwrap();
        engine.replay().await.unwrap();
        a1.id
    };

    let store: Arc<dyn KeyValueStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
    let engine = open(store, ScriptedTransport::new()).await;

    assert_eq!(engine.queue_len().await, 2);
    let conflicts = engine.conflicts().await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].id, conflicted);

    let result = engine.replay().await.unwrap();
    assert_eq!(result.succeeded.len(), 1);
    assert_eq!(result.remaining, 1);
}

#[tokio::test]
async fn syncing_and_legacy_records_load_as_pending() {
    let store = Arc::new(MemoryStore::new());
    let records = json!([
        {"id": "legacy-1", "type": "grade.update", "payload": {"grade": "C"}},
        {"id": "stuck-2", "type": "note.add", "lifecycleState": "Syncing", "version": 3}
    ]);
    store
        .put("offline_queue", serde_json::to_vec(&records).unwrap())
        .await
        .unwrap();

    let engine = open(store, ScriptedTransport::new()).await;
    let queued = engine.queue_snapshot().await;

    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].version, 1);
    assert_eq!(queued[0].lifecycle_state, LifecycleState::Pending);
    assert_eq!(queued[1].version, 3);
    assert_eq!(queued[1].lifecycle_state, LifecycleState::Pending);
}

#[tokio::test]
async fn quota_exhaustion_drops_the_action() {
    let store = Arc::new(MemoryStore::with_quota(512));
    let engine = open(store, ScriptedTransport::new()).await;

    engine.capture("small", json!({"n": 1})).await.unwrap();
    let result = engine
        .capture("big", json!({"blob": "x".repeat(4096)}))
        .await;

    assert!(matches!(result, Err(Error::StorageWrite(_))));
    assert_eq!(engine.queue_len().await, 1);
}

#[tokio::test]
async fn overlapping_replay_is_rejected() {
    let transport = ScriptedTransport::new().with_latency(Duration::from_millis(50));
    let engine = open(Arc::new(MemoryStore::new()), transport).await;
    engine.capture("slow", Value::Null).await.unwrap();

    let (first, second) = futures::join!(engine.replay(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.replay().await
    });

    assert_eq!(first.unwrap().succeeded.len(), 1);
    assert!(matches!(second, Err(Error::ReplayInProgress)));
}

#[tokio::test]
async fn captures_during_replay_wait_for_next_run() {
    let transport = ScriptedTransport::new().with_latency(Duration::from_millis(30));
    let engine = open(Arc::new(MemoryStore::new()), transport).await;
    let early = engine.capture("early", Value::Null).await.unwrap();

    let (result, late) = futures::join!(engine.replay(), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        engine.capture("late", Value::Null).await.unwrap()
    });

    let result = result.unwrap();
    assert_eq!(result.succeeded, vec![early.id]);
    assert_eq!(result.remaining, 1);
    assert_eq!(engine.queue_snapshot().await[0].id, late.id);
}

#[tokio::test]
async fn going_online_triggers_one_replay() {
    let engine = open(Arc::new(MemoryStore::new()), ScriptedTransport::new()).await;
    engine.capture("a", Value::Null).await.unwrap();
    engine.capture("b", Value::Null).await.unwrap();
    let mut events = engine.subscribe();

    let transition = engine.set_online(true).await.unwrap();
    let replay = transition.replay.expect("replay spawned on reconnect");
    let result = replay.await.unwrap().unwrap();
    assert_eq!(result.succeeded.len(), 2);

    // Same state again is not a transition
    assert!(engine.set_online(true).await.is_none());
    assert_eq!(engine.transport().attempts().len(), 2);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen.first(),
        Some(&SyncEvent::ConnectivityChanged {
            state: deferq_sync::ConnectivityState::Online
        })
    );
    assert!(seen.contains(&SyncEvent::SyncComplete));
}

#[tokio::test]
async fn going_online_with_empty_queue_does_not_replay() {
    let engine = open(Arc::new(MemoryStore::new()), ScriptedTransport::new()).await;

    let transition = engine.set_online(true).await.unwrap();
    assert!(transition.replay.is_none());

    let transition = engine.set_online(false).await.unwrap();
    assert_eq!(transition.state, deferq_sync::ConnectivityState::Offline);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn capture_count_matches_queue_length(types in prop::collection::vec("[a-z]{1,8}\\.[a-z]{1,8}", 0..20)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let engine = open(Arc::new(MemoryStore::new()), ScriptedTransport::new()).await;
            let mut ids = std::collections::HashSet::new();
            for action_type in &types {
                let action = engine.capture(action_type, Value::Null).await.unwrap();
                ids.insert(action.id);
            }
            assert_eq!(engine.queue_len().await, types.len());
            assert_eq!(ids.len(), types.len());
        });
    }
}
