#![cfg(unix)]

mod common;

use common::{registration, GAME};
use core_sync::{ObserverStatus, PipelineError, SyncMode, TurnSubmission, WorldStore};
use engine_runtime::RegistrationId;
use report_schema::FactionNumber;

#[tokio::test]
async fn new_faction_is_resolved_and_synced() {
    let h = common::harness(common::ENGINE);
    let submission = TurnSubmission {
        orders: Vec::new(),
        registrations: vec![registration(7, "Newcomers")],
    };

    let first = h.pipeline.run_turn(GAME, submission, None).await.unwrap();
    assert_eq!(first.resolved, vec![(RegistrationId(7), FactionNumber(3))]);
    assert!(first.unresolved.is_empty());
    match &first.observer(FactionNumber(3)).unwrap().status {
        ObserverStatus::Synced { mode, metrics, .. } => {
            assert_eq!(*mode, SyncMode::Fresh);
            assert_eq!(metrics.units_created, 1);
        }
        other => panic!("new faction did not sync: {other:?}"),
    }

    let record = h.store.load_game(GAME).unwrap().unwrap();
    assert!(record.pending.is_empty());
    assert_eq!(
        record.slot(FactionNumber(3)).unwrap().password.as_deref(),
        Some("joined")
    );

    let second = h
        .pipeline
        .run_turn(GAME, TurnSubmission::default(), None)
        .await
        .unwrap();
    assert!(second.resolved.is_empty());
    match &second.observer(FactionNumber(3)).unwrap().status {
        ObserverStatus::Synced { mode, .. } => assert_eq!(*mode, SyncMode::CarryForward),
        other => panic!("new faction did not sync: {other:?}"),
    }
}

#[tokio::test]
async fn unmatched_registration_stays_pending() {
    let h = common::harness(common::ENGINE);
    let submission = TurnSubmission {
        orders: Vec::new(),
        registrations: vec![registration(8, "Latecomers")],
    };

    let outcome = h.pipeline.run_turn(GAME, submission, None).await.unwrap();
    assert!(outcome.resolved.is_empty());
    assert_eq!(outcome.unresolved, vec![RegistrationId(8)]);

    let record = h.store.load_game(GAME).unwrap().unwrap();
    assert_eq!(record.turn, 1);
    assert_eq!(record.pending.len(), 1);
    assert_eq!(record.pending[0].name, "Latecomers");
}

#[tokio::test]
async fn prefix_colliding_registrations_are_rejected_up_front() {
    let h = common::harness(common::ENGINE);
    let submission = TurnSubmission {
        orders: Vec::new(),
        registrations: vec![registration(1, "Newcomers"), registration(2, "Newcomers Two")],
    };

    let err = h.pipeline.run_turn(GAME, submission, None).await.unwrap_err();
    assert!(matches!(err, PipelineError::Registration { .. }));
    assert_eq!(h.store.load_game(GAME).unwrap().unwrap().turn, 0);
}
