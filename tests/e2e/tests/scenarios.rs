//! End-to-end scenarios through the full engine
//!
//! Each test drives the public facade the way a transport adapter would:
//! ingest, drain the session queue, inspect rows, edges, events, zones.

use chrono::{Duration, Utc};
use credence_e2e_tests::harness::TestEngine;
use credence_e2e_tests::mocks::{axis, judge_match};
use credence_core::{
    ConflictKind, CoreError, EdgeType, EventType, ExposureQueued, ExposureStatus,
    MemoryRequest, MemoryState, Outcome, ViolationOrigin, ZoneParams,
};

const SESSION: &str = "session-e2e";

/// Scenario: a pure observation with nothing to contradict
#[tokio::test]
async fn observation_with_no_contradictions_stays_active() {
    let t = TestEngine::new();

    let outcome = t.observe(SESSION, "AAPL closed at 170").await;
    assert_eq!(outcome.status, MemoryState::Active);
    assert_eq!(outcome.exposure_check, ExposureQueued::Queued);

    // The checker runs against empty condition indexes
    t.engine.drain_session(SESSION, 10).await.unwrap();

    let record = t.store.get_memory(&outcome.id).await.unwrap().unwrap();
    assert_eq!(record.state, MemoryState::Active);
    assert_eq!(record.exposure_check_status, ExposureStatus::Completed);
    assert!(record.violations.is_empty());
    assert_eq!(record.confirmations, 0);
    assert_eq!(record.starting_confidence, 0.9);
    assert!(record.propagated_confidence.is_none());
}

/// Scenario: a prediction violated by a later observation
#[tokio::test]
async fn prediction_is_violated_by_matching_observation() {
    let t = TestEngine::new();

    let invalidates = "AAPL closes below 150 before 2025-06-01";
    let confirms = "AAPL closes above 180 before 2025-06-01";
    let breaking_news = "AAPL closed at 145 on May 15";
    t.embedder.preset(invalidates, axis(40));
    t.embedder.preset(breaking_news, axis(40));
    t.embedder.preset(confirms, axis(41));

    let x = t.observe(SESSION, "AAPL revenue grew 10 percent").await;
    let p = t
        .engine
        .ingest(
            MemoryRequest {
                content: "AAPL will close above 180 by June".to_string(),
                derived_from: vec![x.id.clone()],
                invalidates_if: vec![invalidates.to_string()],
                confirms_if: vec![confirms.to_string()],
                outcome_condition: Some("close >= 180".to_string()),
                resolves_by: Some(Utc::now() + Duration::days(60)),
                ..Default::default()
            },
            SESSION,
            "req-p",
        )
        .await
        .unwrap();
    assert!(p.time_bound);
    let d = t
        .think(SESSION, "Expect elevated call volume", vec![p.id.clone()])
        .await;

    // Settle the queued checks that precede the breaking observation
    t.engine.drain_session(SESSION, 10).await.unwrap();

    t.judge.push_judge(&judge_match(0.9));
    t.observe(SESSION, breaking_news).await;
    t.engine.drain_session(SESSION, 10).await.unwrap();

    let prediction = t.store.get_memory(&p.id).await.unwrap().unwrap();
    assert_eq!(prediction.violations.len(), 1);
    assert_eq!(prediction.violations[0].condition, invalidates);
    assert_eq!(prediction.state, MemoryState::Violated);
    assert_eq!(prediction.contradictions, 1);
    assert_eq!(prediction.times_tested, 1);

    let obs_id = prediction.violations[0].obs_id.clone();
    let edges = t
        .store
        .list_edges_incident(&[p.id.clone()], &[EdgeType::ViolatedBy], 0.0)
        .await
        .unwrap();
    assert!(edges
        .iter()
        .any(|e| e.source_id == obs_id && e.target_id == p.id && e.strength == 1.0));

    let events = t.store.list_events(SESSION).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::Violation && e.memory_id == p.id));

    // The cascade reached the derivative with a non-positive update
    let derivative = t.store.get_memory(&d.id).await.unwrap().unwrap();
    let propagated = derivative.propagated_confidence.expect("cascade reached d");
    assert!(propagated < 0.5, "expected a drop, got {}", propagated);

    // Queued cascade damage commits on the next drain
    t.engine.drain_session(SESSION, 10).await.unwrap();
    let derivative = t.store.get_memory(&d.id).await.unwrap().unwrap();
    assert_eq!(derivative.cascade_damages, 1);
    assert_eq!(
        derivative.violations[0].source_type,
        ViolationOrigin::Cascade
    );
}

/// Scenario: a thought confirmed by a later observation keeps its state
#[tokio::test]
async fn thought_is_confirmed_without_state_change() {
    let t = TestEngine::new();

    let confirms = "AAPL closed above last week's high";
    let good_news = "AAPL closed at an all-time high";
    t.embedder.preset(confirms, axis(5));
    t.embedder.preset(good_news, axis(5));

    let a = t.observe(SESSION, "AAPL reclaimed its 50-day average").await;
    let b = t.observe(SESSION, "Breadth improved across tech").await;
    let thought = t
        .engine
        .ingest(
            MemoryRequest {
                content: "AAPL is in an uptrend".to_string(),
                derived_from: vec![a.id, b.id],
                confirms_if: vec![confirms.to_string()],
                ..Default::default()
            },
            SESSION,
            "req-t",
        )
        .await
        .unwrap();
    t.engine.drain_session(SESSION, 10).await.unwrap();

    t.judge.push_judge(&judge_match(0.85));
    let obs = t.observe(SESSION, good_news).await;
    t.engine.drain_session(SESSION, 10).await.unwrap();

    let record = t.store.get_memory(&thought.id).await.unwrap().unwrap();
    assert_eq!(record.confirmations, 1);
    assert_eq!(record.times_tested, 1);
    assert_eq!(record.state, MemoryState::Active);

    let edges = t
        .store
        .list_edges_incident(&[thought.id.clone()], &[EdgeType::ConfirmedBy], 0.0)
        .await
        .unwrap();
    assert!(edges
        .iter()
        .any(|e| e.source_id == obs.id && e.target_id == thought.id));
}

/// Scenario: near-identical content is rejected with the duplicate's id
#[tokio::test]
async fn duplicate_ingest_returns_conflict() {
    let t = TestEngine::new();
    let first = t.observe(SESSION, "AAPL closed at 170").await;

    let err = t
        .engine
        .ingest(
            MemoryRequest {
                content: "AAPL closed at 170".to_string(),
                source: Some("market".to_string()),
                ..Default::default()
            },
            SESSION,
            "req-dup",
        )
        .await
        .unwrap_err();
    match err {
        CoreError::Conflict(ConflictKind::Duplicate {
            duplicate_id,
            duplicate_content,
            similarity,
        }) => {
            assert_eq!(duplicate_id, first.id);
            assert_eq!(duplicate_content, "AAPL closed at 170");
            assert!(similarity > 0.85);
        }
        other => panic!("expected duplicate conflict, got {:?}", other),
    }
}

/// Scenario: a zone around a supported pair, with an external contradictor
#[tokio::test]
async fn zone_reports_contradiction_on_its_boundary() {
    let t = TestEngine::new();

    let b = t.observe(SESSION, "Rates held steady this quarter").await;
    let a = t
        .think(SESSION, "Equity multiples can stay rich", vec![b.id.clone()])
        .await;
    let c = t.observe(SESSION, "Multiples compressed sharply").await;
    t.store
        .upsert_edge(&c.id, &a.id, EdgeType::ViolatedBy, 1.0)
        .await
        .unwrap();

    let zone = t
        .engine
        .zone(ZoneParams {
            memory_id: Some(b.id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();

    let mut member_ids: Vec<&str> = zone.members.iter().map(|m| m.id.as_str()).collect();
    member_ids.sort_unstable();
    let mut expected = [a.id.as_str(), b.id.as_str()];
    expected.sort_unstable();
    assert_eq!(member_ids, expected);

    let boundary = zone
        .boundary
        .iter()
        .find(|entry| entry.id == c.id)
        .expect("contradictor on the boundary");
    assert_eq!(
        boundary.reasons,
        vec![format!("contradicts [{}] (violated_by)", a.id)]
    );
    assert_eq!(zone.cut_edges.len(), 1);
    assert!(zone.unsafe_reasons.is_empty());
    assert!(zone.balanced);
    assert!(zone.quality > 0.0 && zone.quality < 1.0);
}

/// Scenario: correct resolution boosts descendants and queues cascades
#[tokio::test]
async fn correct_resolution_cascades_to_descendants() {
    let t = TestEngine::new();

    let x = t.observe(SESSION, "AAPL broke out on volume").await;
    let p = t
        .engine
        .ingest(
            MemoryRequest {
                content: "AAPL will close above 180 by June".to_string(),
                derived_from: vec![x.id],
                invalidates_if: vec!["AAPL closes below 150".to_string()],
                confirms_if: vec!["AAPL closes above 180".to_string()],
                outcome_condition: Some("close >= 180".to_string()),
                resolves_by: Some(Utc::now() + Duration::days(60)),
                ..Default::default()
            },
            SESSION,
            "req-p",
        )
        .await
        .unwrap();
    let d = t
        .think(SESSION, "Premiums should stay elevated", vec![p.id.clone()])
        .await;
    t.engine.drain_session(SESSION, 10).await.unwrap();
    assert_eq!(t.indexes.invalidates.len(), 1);
    assert_eq!(t.indexes.confirms.len(), 1);

    let resolved = t
        .engine
        .resolve(SESSION, &p.id, Outcome::Correct, Some("target hit"), None, false)
        .await
        .unwrap();
    assert_eq!(resolved.outcome, Outcome::Correct);

    let prediction = t.store.get_memory(&p.id).await.unwrap().unwrap();
    assert_eq!(prediction.state, MemoryState::Resolved);
    assert_eq!(prediction.outcome, Some(Outcome::Correct));
    assert_eq!(t.indexes.invalidates.len(), 0);
    assert_eq!(t.indexes.confirms.len(), 0);

    // Positive shock: the descendant's confidence is non-decreasing
    let derivative = t.store.get_memory(&d.id).await.unwrap().unwrap();
    let propagated = derivative.propagated_confidence.expect("boost reached d");
    assert!(propagated >= 0.5, "expected non-decreasing, got {}", propagated);

    let events = t.store.list_events(SESSION).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::CascadeBoost && e.memory_id == d.id));
    assert!(events.iter().any(|e| e.event_type == EventType::Resolution));

    // The dispatcher commits the queued boost
    t.engine.drain_session(SESSION, 10).await.unwrap();
    let derivative = t.store.get_memory(&d.id).await.unwrap().unwrap();
    assert_eq!(derivative.cascade_boosts, 1);
    assert!(derivative.last_cascade_at.is_some());
}
