//! Queue semantics and idempotence laws at the engine boundary

use chrono::{Duration, Utc};
use credence_e2e_tests::harness::TestEngine;
use credence_core::{
    CascadeAction, EventType, MemoryEvent, MemoryRequest, MemoryState,
};

const SESSION: &str = "session-queue";

#[tokio::test]
async fn events_are_claimed_fifo_per_session() {
    let t = TestEngine::new();

    for i in 0..3 {
        let mut event = MemoryEvent::new(SESSION, EventType::Violation, format!("m{}", i));
        event.created_at = Utc::now() + Duration::milliseconds(i);
        t.store.append_event(&event).await.unwrap();
    }
    let mut other = MemoryEvent::new("other-session", EventType::Violation, "foreign");
    other.created_at = Utc::now() - Duration::seconds(10);
    t.store.append_event(&other).await.unwrap();

    let first_batch = t.store.claim_due_events(SESSION, 2).await.unwrap();
    let ids: Vec<&str> = first_batch.iter().map(|e| e.memory_id.as_str()).collect();
    assert_eq!(ids, ["m0", "m1"]);

    let second_batch = t.store.claim_due_events(SESSION, 10).await.unwrap();
    assert_eq!(second_batch.len(), 1);
    assert_eq!(second_batch[0].memory_id, "m2");

    // The foreign session's event is untouched
    let foreign = t.store.claim_due_events("other-session", 10).await.unwrap();
    assert_eq!(foreign.len(), 1);
}

#[tokio::test]
async fn cascade_apply_is_guarded_by_the_event_bit() {
    let t = TestEngine::new();
    let target = t.observe(SESSION, "DAX closed at a record").await;

    let event = MemoryEvent::new(SESSION, EventType::CascadeBoost, &target.id);
    t.store.append_event(&event).await.unwrap();

    let first = t
        .engine
        .apply_cascade(&target.id, CascadeAction::Boost, Some(&event.id), None, None)
        .await
        .unwrap();
    let second = t
        .engine
        .apply_cascade(&target.id, CascadeAction::Boost, Some(&event.id), None, None)
        .await
        .unwrap();
    assert!(first.applied);
    assert!(!second.applied);

    let record = t.store.get_memory(&target.id).await.unwrap().unwrap();
    assert_eq!(record.cascade_boosts, 1);
}

#[tokio::test]
async fn ingest_retry_with_chosen_id_is_idempotent() {
    let t = TestEngine::new();
    let request = MemoryRequest {
        id: Some("retry-me".to_string()),
        content: "CAC held its gains".to_string(),
        source: Some("market".to_string()),
        ..Default::default()
    };

    let first = t
        .engine
        .ingest(request.clone(), SESSION, "req-1")
        .await
        .unwrap();
    let retried = t
        .engine
        .ingest(request, SESSION, "req-1-retry")
        .await
        .unwrap();

    assert_eq!(first.id, "retry-me");
    assert_eq!(retried.id, "retry-me");
    assert_eq!(retried.status, MemoryState::Active);
    // One row, one content vector, one exposure event
    assert_eq!(t.indexes.content.len(), 1);
    assert_eq!(t.store.list_events(SESSION).await.unwrap().len(), 1);
}

#[tokio::test]
async fn retraction_leaves_no_vectors_behind() {
    let t = TestEngine::new();
    let parent = t.observe(SESSION, "FTSE finished flat").await;
    let prediction = t
        .engine
        .ingest(
            MemoryRequest {
                content: "FTSE breaks out within a month".to_string(),
                derived_from: vec![parent.id],
                invalidates_if: vec!["FTSE drops 5 percent".to_string()],
                confirms_if: vec!["FTSE gains 5 percent".to_string()],
                outcome_condition: Some("gain >= 5%".to_string()),
                resolves_by: Some(Utc::now() + Duration::days(30)),
                ..Default::default()
            },
            SESSION,
            "req-p",
        )
        .await
        .unwrap();
    assert_eq!(t.indexes.content.len(), 2);
    assert_eq!(t.indexes.invalidates.len(), 1);
    assert_eq!(t.indexes.confirms.len(), 1);

    t.engine.retract(&prediction.id).await.unwrap();

    assert_eq!(t.indexes.content.len(), 1);
    assert_eq!(t.indexes.invalidates.len(), 0);
    assert_eq!(t.indexes.confirms.len(), 0);

    let record = t.store.get_memory(&prediction.id).await.unwrap().unwrap();
    assert!(record.retracted);
}
