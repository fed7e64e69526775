//! End-to-end sync engine tests against the in-memory remote.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use medrecords_core::db::{Database, SharedDatabase};
use medrecords_core::models::{AppointmentFields, EntityKind, PatientFields};
use medrecords_core::sync::{
    AppLifecycle, ConflictKind, DiscardReason, ManualClock, ManualLifecycle, MockOp,
    MockRemote, PushWorker, RemoteError, RetryConfig, StaticConnectivity, StaticTokenProvider,
    SyncConfig, SyncPorts, SyncScheduler, SyncStatus, SyncTrigger, TriggerOutcome,
};

struct Harness {
    db: SharedDatabase,
    remote: Arc<MockRemote>,
    clock: Arc<ManualClock>,
    connectivity: Arc<StaticConnectivity>,
    scheduler: Arc<SyncScheduler>,
}

fn config() -> SyncConfig {
    SyncConfig::new("mock")
        .with_page_size(2)
        .with_retry(RetryConfig::default().with_jitter(Duration::ZERO))
}

fn harness_with(db: SharedDatabase) -> Harness {
    let remote = Arc::new(MockRemote::new());
    remote.require_token("token");
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
    ));
    let connectivity = Arc::new(StaticConnectivity::new(true));
    let ports = SyncPorts::new(
        connectivity.clone(),
        Arc::new(StaticTokenProvider::new(Some("token".into()))),
        Arc::new(ManualLifecycle::new(AppLifecycle::Foreground)),
    )
    .with_clock(clock.clone());
    let scheduler =
        Arc::new(SyncScheduler::new(db.clone(), remote.clone(), config(), ports).unwrap());

    Harness {
        db,
        remote,
        clock,
        connectivity,
        scheduler,
    }
}

fn harness() -> Harness {
    harness_with(Database::open_in_memory().unwrap().into_shared())
}

async fn cycle(h: &Harness) -> medrecords_core::sync::CycleReport {
    match h.scheduler.trigger(SyncTrigger::Manual).await {
        TriggerOutcome::Completed(report) => report,
        other => panic!("cycle did not run: {:?}", other),
    }
}

#[tokio::test]
async fn test_offline_edits_reach_server_and_server_edits_come_back() {
    let h = harness();
    h.connectivity.set_online(false);

    let (patient, appointment) = {
        let db = h.db.lock().unwrap();
        let patient = db.create_patient(PatientFields::named("Ana")).unwrap();
        let appointment = db
            .create_appointment(
                &patient.local_id,
                AppointmentFields::scheduled("2024-06-10T09:00:00Z", 30),
            )
            .unwrap();
        (patient, appointment)
    };
    assert!(matches!(
        h.scheduler.trigger(SyncTrigger::Manual).await,
        TriggerOutcome::Offline
    ));
    assert_eq!(h.db.lock().unwrap().outbox_len().unwrap(), 2);

    h.connectivity.set_online(true);
    let report = cycle(&h).await;
    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(report.push.succeeded, 2);

    let (remote_patient, remote_appointment) = {
        let db = h.db.lock().unwrap();
        assert_eq!(db.outbox_len().unwrap(), 0);
        let patient = db.get_patient(&patient.local_id).unwrap().unwrap();
        let appointment = db.get_appointment(&appointment.local_id).unwrap().unwrap();
        (patient.remote_id.unwrap(), appointment.remote_id.unwrap())
    };
    assert_eq!(h.remote.patient(&remote_patient).unwrap().fields.name, "Ana");
    assert_eq!(
        h.remote.appointment(&remote_appointment).unwrap().patient_id,
        remote_patient
    );

    // Another device edits both records
    h.remote
        .server_update_patient(&remote_patient, PatientFields::named("Ana Lima"));
    let mut moved = AppointmentFields::scheduled("2024-06-11T10:00:00Z", 45);
    moved.reason = Some("Follow-up".into());
    h.remote
        .server_update_appointment(&remote_appointment, moved.clone());

    let report = cycle(&h).await;
    assert!(report.is_success());
    assert!(report.pulled(EntityKind::Patient) >= 1);
    assert!(report.pulled(EntityKind::Appointment) >= 1);

    let db = h.db.lock().unwrap();
    let patient = db.get_patient(&patient.local_id).unwrap().unwrap();
    assert_eq!(patient.fields.name, "Ana Lima");
    let appointment = db.get_appointment(&appointment.local_id).unwrap().unwrap();
    assert_eq!(appointment.fields, moved);
    assert_eq!(db.last_successful_sync().unwrap(), Some(report.finished_at));
}

#[tokio::test]
async fn test_repeated_cycles_are_stable() {
    let h = harness();
    for i in 0..5 {
        h.remote
            .server_create_patient(PatientFields::named(format!("Patient {}", i)));
    }

    let first = cycle(&h).await;
    assert_eq!(first.pulled(EntityKind::Patient), 5);
    let before = h.db.lock().unwrap().list_patients().unwrap();

    let second = cycle(&h).await;
    assert_eq!(second.pulled(EntityKind::Patient), 0);
    assert_eq!(second.push.attempted, 0);
    assert_eq!(h.db.lock().unwrap().list_patients().unwrap(), before);
}

#[tokio::test]
async fn test_stale_update_is_dropped_and_server_version_restored() {
    let h = harness();
    let remote_id = h.remote.server_create_patient(PatientFields::named("Ana"));
    cycle(&h).await;

    h.remote
        .server_update_patient(&remote_id, PatientFields::named("Ana (server)"));
    let local_id = {
        let db = h.db.lock().unwrap();
        let patient = db.get_patient_by_remote_id(&remote_id).unwrap().unwrap();
        db.update_patient(&patient.local_id, PatientFields::named("Ana (device)"))
            .unwrap();
        patient.local_id
    };
    h.remote.fail_next(
        MockOp::Update,
        RemoteError::conflict(ConflictKind::Stale, "precondition failed"),
    );

    let report = cycle(&h).await;
    assert_eq!(report.push.conflicts, 1);
    assert_eq!(report.push.discarded[0].reason, DiscardReason::Conflict);
    assert!(report.is_success());

    let db = h.db.lock().unwrap();
    assert_eq!(db.outbox_len().unwrap(), 0);
    let patient = db.get_patient(&local_id).unwrap().unwrap();
    assert_eq!(patient.fields.name, "Ana (server)");
}

#[tokio::test]
async fn test_transient_failure_is_retried_until_delivered() {
    let h = harness();
    h.db.lock()
        .unwrap()
        .create_patient(PatientFields::named("Ana"))
        .unwrap();
    h.remote
        .fail_times(MockOp::Create, 2, RemoteError::Transient("503".into()));

    let report = cycle(&h).await;
    assert!(!report.is_success());
    assert_eq!(h.scheduler.snapshot().status, SyncStatus::Error);
    assert_eq!(h.scheduler.snapshot().pending_mutations, 1);

    // Within backoff: nothing is sent
    cycle(&h).await;
    assert_eq!(h.remote.call_count(MockOp::Create), 1);

    for _ in 0..2 {
        h.clock.advance(Duration::from_secs(600));
        cycle(&h).await;
    }

    assert_eq!(h.remote.call_count(MockOp::Create), 3);
    assert_eq!(h.remote.patients().len(), 1);
    let snapshot = h.scheduler.snapshot();
    assert_eq!(snapshot.status, SyncStatus::Synced);
    assert_eq!(snapshot.pending_mutations, 0);
    assert!(snapshot.last_error.is_none());
}

#[tokio::test]
async fn test_exhausted_mutation_needs_attention() {
    let h = harness();
    h.db.lock()
        .unwrap()
        .create_patient(PatientFields::named("Ana"))
        .unwrap();
    h.remote
        .fail_times(MockOp::Create, 20, RemoteError::Timeout);

    for _ in 0..8 {
        cycle(&h).await;
        h.clock.advance(Duration::from_secs(600));
    }

    assert_eq!(h.remote.call_count(MockOp::Create), 6);
    let snapshot = h.scheduler.snapshot();
    assert_eq!(snapshot.needs_attention, 1);
    assert_eq!(snapshot.pending_mutations, 0);
}

#[tokio::test]
async fn test_rejected_credentials_keep_mutations_queued() {
    let h = harness();
    h.remote.require_token("rotated");
    h.db.lock()
        .unwrap()
        .create_patient(PatientFields::named("Ana"))
        .unwrap();
    h.db.lock()
        .unwrap()
        .create_patient(PatientFields::named("Bruno"))
        .unwrap();

    let report = cycle(&h).await;
    assert!(matches!(
        report.push.first_error,
        Some(RemoteError::Unauthorized(_))
    ));
    assert_eq!(h.remote.call_count(MockOp::Create), 1);
    assert_eq!(h.db.lock().unwrap().outbox_len().unwrap(), 2);
}

#[tokio::test]
async fn test_rejected_credentials_never_exhaust_retries() {
    let h = harness();
    h.remote.require_token("rotated");
    h.db.lock()
        .unwrap()
        .create_patient(PatientFields::named("Ana"))
        .unwrap();

    for _ in 0..8 {
        let report = cycle(&h).await;
        assert!(report.push.discarded.is_empty());
        h.clock.advance(Duration::from_secs(600));
    }
    let snapshot = h.scheduler.snapshot();
    assert_eq!(snapshot.pending_mutations, 1);
    assert_eq!(snapshot.needs_attention, 0);

    h.remote.require_token("token");
    let report = cycle(&h).await;
    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(report.push.succeeded, 1);
    assert_eq!(h.remote.patients()[0].fields.name, "Ana");
}

#[tokio::test]
async fn test_conflict_without_newer_server_change_restores_server_copy() {
    let h = harness();
    let remote_id = h.remote.server_create_patient(PatientFields::named("Ana"));
    cycle(&h).await;

    let local_id = {
        let db = h.db.lock().unwrap();
        let patient = db.get_patient_by_remote_id(&remote_id).unwrap().unwrap();
        db.update_patient(&patient.local_id, PatientFields::named("Device edit"))
            .unwrap();
        patient.local_id
    };
    h.remote.fail_next(
        MockOp::Update,
        RemoteError::conflict(ConflictKind::Stale, "precondition failed"),
    );

    let report = cycle(&h).await;
    assert_eq!(report.push.conflicts, 1);
    assert_eq!(report.pulled(EntityKind::Patient), 0);

    let db = h.db.lock().unwrap();
    assert_eq!(db.outbox_len().unwrap(), 0);
    let patient = db.get_patient(&local_id).unwrap().unwrap();
    assert_eq!(patient.fields.name, "Ana");
    assert_eq!(patient.updated_at, h.remote.patient(&remote_id).unwrap().updated_at);
}

#[tokio::test]
async fn test_unstorable_server_records_do_not_block_pull() {
    let h = harness();
    let patient_id = h.remote.server_create_patient(PatientFields::named("Ana"));
    h.remote.server_create_appointment(
        &patient_id,
        AppointmentFields::scheduled("2024-06-10T09:00:00Z", 0),
    );
    h.remote.server_insert_raw(
        EntityKind::Appointment,
        serde_json::json!({
            "patientId": patient_id,
            "scheduledAt": "2024-06-10T10:00:00Z",
            "durationMinutes": 30,
            "status": "rescheduled",
        }),
    );
    let good = h.remote.server_create_appointment(
        &patient_id,
        AppointmentFields::scheduled("2024-06-10T11:00:00Z", 30),
    );

    let report = cycle(&h).await;
    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(report.pulled(EntityKind::Appointment), 1);
    assert!(h
        .db
        .lock()
        .unwrap()
        .get_appointment_by_remote_id(&good)
        .unwrap()
        .is_some());

    let later = h.remote.server_create_appointment(
        &patient_id,
        AppointmentFields::scheduled("2024-06-12T09:00:00Z", 15),
    );
    let report = cycle(&h).await;
    assert!(report.is_success());
    assert_eq!(report.pulled(EntityKind::Appointment), 1);
    assert!(h
        .db
        .lock()
        .unwrap()
        .get_appointment_by_remote_id(&later)
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_unsent_edit_survives_pull_until_delivered() {
    let h = harness();
    let remote_id = h.remote.server_create_patient(PatientFields::named("Ana"));
    cycle(&h).await;

    let local_id = {
        let db = h.db.lock().unwrap();
        let patient = db.get_patient_by_remote_id(&remote_id).unwrap().unwrap();
        db.update_patient(&patient.local_id, PatientFields::named("Device edit"))
            .unwrap();
        patient.local_id
    };
    h.remote
        .server_update_patient(&remote_id, PatientFields::named("Other device"));
    h.remote
        .fail_next(MockOp::Update, RemoteError::Transient("503".into()));

    let report = cycle(&h).await;
    assert_eq!(report.pulled(EntityKind::Patient), 1);
    {
        let db = h.db.lock().unwrap();
        assert_eq!(db.outbox_len().unwrap(), 1);
        let patient = db.get_patient(&local_id).unwrap().unwrap();
        assert_eq!(patient.fields.name, "Device edit");
    }

    h.clock.advance(Duration::from_secs(600));
    let report = cycle(&h).await;
    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(h.remote.patient(&remote_id).unwrap().fields.name, "Device edit");
    let db = h.db.lock().unwrap();
    assert_eq!(db.outbox_len().unwrap(), 0);
    assert_eq!(
        db.get_patient(&local_id).unwrap().unwrap().fields.name,
        "Device edit"
    );
}

#[tokio::test]
async fn test_fresh_install_reports_not_synced() {
    let h = harness();
    assert_eq!(h.scheduler.snapshot().status, SyncStatus::NotSynced);

    cycle(&h).await;
    assert_eq!(h.scheduler.snapshot().status, SyncStatus::Synced);
}

#[tokio::test]
async fn test_outbox_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.db");

    let local_id = {
        let db = Database::open(&path).unwrap();
        let patient = db.create_patient(PatientFields::named("Ana")).unwrap();
        db.update_patient(&patient.local_id, PatientFields::named("Ana Lima"))
            .unwrap();
        patient.local_id
    };

    let h = harness_with(Database::open(&path).unwrap().into_shared());
    assert_eq!(h.scheduler.snapshot().pending_mutations, 2);

    let report = cycle(&h).await;
    assert_eq!(report.push.succeeded, 2);

    let remote_id = h
        .db
        .lock()
        .unwrap()
        .get_patient(&local_id)
        .unwrap()
        .unwrap()
        .remote_id
        .unwrap();
    assert_eq!(h.remote.patient(&remote_id).unwrap().fields.name, "Ana Lima");
}

#[derive(Debug, Clone)]
enum Edit {
    Rename(String),
    RenameAfterOutage(String),
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        "[A-Z][a-z]{1,8}".prop_map(Edit::Rename),
        "[A-Z][a-z]{1,8}".prop_map(Edit::RenameAfterOutage),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_mutations_replay_in_order(edits in prop::collection::vec(edit_strategy(), 0..6), delete in any::<bool>()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let db = Database::open_in_memory().unwrap().into_shared();
        let remote = Arc::new(MockRemote::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()));
        let worker = PushWorker::new(db.clone(), remote.clone(), clock.clone(), config());

        let local_id = {
            let db = db.lock().unwrap();
            let patient = db.create_patient(PatientFields::named("Start")).unwrap();
            for edit in &edits {
                let name = match edit {
                    Edit::Rename(name) => name,
                    Edit::RenameAfterOutage(name) => {
                        remote.fail_next(MockOp::Update, RemoteError::Transient("502".into()));
                        name
                    }
                };
                db.update_patient(&patient.local_id, PatientFields::named(name.clone())).unwrap();
            }
            if delete {
                db.delete_patient(&patient.local_id).unwrap();
            }
            patient.local_id
        };

        runtime.block_on(async {
            for _ in 0..(edits.len() * 2 + 4) {
                worker.drain("t").await.unwrap();
                clock.advance(Duration::from_secs(600));
            }
        });

        prop_assert_eq!(db.lock().unwrap().outbox_len().unwrap(), 0);

        // Each failed update is retried in place before later mutations go out
        let outages = edits.iter().filter(|e| matches!(e, Edit::RenameAfterOutage(_))).count();
        let delivered: Vec<MockOp> = remote.calls().iter().map(|c| c.op).collect();
        let mut expected = vec![MockOp::Create];
        expected.extend(std::iter::repeat(MockOp::Update).take(edits.len() + outages));
        if delete {
            expected.push(MockOp::Delete);
        }
        prop_assert_eq!(delivered, expected);

        let remote_id = db.lock().unwrap().get_patient(&local_id).unwrap().unwrap().remote_id.unwrap();
        let stored = remote.patient(&remote_id);
        if delete {
            prop_assert!(stored.is_none());
        } else {
            let last = edits.last().map(|e| match e {
                Edit::Rename(n) | Edit::RenameAfterOutage(n) => n.clone(),
            }).unwrap_or_else(|| "Start".to_string());
            prop_assert_eq!(stored.unwrap().fields.name, last);
        }
    }
}
