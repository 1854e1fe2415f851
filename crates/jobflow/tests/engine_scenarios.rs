//! End-to-end scenarios over the in-memory stores
//!
//! Exercises the full claim/dispatch/retry loop, timer promotion and the
//! history pipeline the way a deployment wires them together, with a
//! manual clock standing in for wall time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use serde_json::json;

use jobflow::history::{CaseInstanceFields, TaskFields};
use jobflow::prelude::*;
use jobflow::reliability::RetryHandler;

const WORKER: &str = "test-worker";
const LEASE: Duration = Duration::from_secs(300);

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<InMemoryJobStore>,
    history: Arc<InMemoryHistoryStore>,
    scheduler: JobScheduler,
    dispatcher: Dispatcher,
}

/// Handler that fails a set number of times before succeeding
struct FlakyHandler {
    failures_left: AtomicU32,
}

#[async_trait]
impl JobHandler for FlakyHandler {
    fn handler_type(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, _job: &Job) -> Result<(), JobHandlerError> {
        // Ok means there was a failure left to burn.
        match self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(JobHandlerError::retryable("transient failure")),
            Err(_) => Ok(()),
        }
    }
}

struct PoisonHandler;

#[async_trait]
impl JobHandler for PoisonHandler {
    fn handler_type(&self) -> &str {
        "poison"
    }

    async fn execute(&self, _job: &Job) -> Result<(), JobHandlerError> {
        Err(JobHandlerError::fatal("unrecoverable payload"))
    }
}

struct OkHandler;

#[async_trait]
impl JobHandler for OkHandler {
    fn handler_type(&self) -> &str {
        "ok"
    }

    async fn execute(&self, _job: &Job) -> Result<(), JobHandlerError> {
        Ok(())
    }
}

fn harness(failures: u32) -> Harness {
    let clock: Arc<ManualClock> = Arc::new(ManualClock::starting_now());
    let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
    let history = Arc::new(InMemoryHistoryStore::new());

    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(FlakyHandler {
        failures_left: AtomicU32::new(failures),
    }));
    registry.register(Arc::new(PoisonHandler));
    registry.register(Arc::new(OkHandler));
    registry.register(Arc::new(HistoryJobHandler::new(history.clone())));

    let retry = Arc::new(RetryHandler::new(
        store.clone(),
        clock.clone(),
        RetryPolicy::immediate(3),
    ));
    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(registry),
        retry,
        clock.clone(),
    );

    Harness {
        scheduler: JobScheduler::new(store.clone()),
        clock,
        store,
        history,
        dispatcher,
    }
}

async fn claim_one(h: &Harness, kind: JobKind) -> Job {
    let mut jobs = h
        .store
        .acquire_jobs(kind, None, 1, WORKER, LEASE)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1, "expected exactly one eligible {kind} job");
    jobs.remove(0)
}

/// Drive every claimable job of a kind to completion, advancing the
/// clock past lease expiry between rounds so requeued jobs come back.
async fn drain(h: &Harness, kind: JobKind) {
    for _ in 0..20 {
        let jobs = h
            .store
            .acquire_jobs(kind, None, 10, WORKER, LEASE)
            .await
            .unwrap();
        if jobs.is_empty() {
            return;
        }
        for job in &jobs {
            h.dispatcher.execute(job, WORKER).await.unwrap();
        }
        h.clock.advance(Duration::from_secs(1));
    }
    panic!("queue did not drain");
}

// =============================================================================
// Leasing
// =============================================================================

#[test_log::test(tokio::test)]
async fn concurrent_claimers_see_disjoint_jobs() {
    let h = harness(0);
    for _ in 0..20 {
        h.scheduler
            .schedule(ScheduleRequest::new(JobKind::ExternalWorker, "ok", json!({})))
            .await
            .unwrap();
    }

    let store_a = h.store.clone();
    let store_b = h.store.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { store_a.acquire_jobs(JobKind::ExternalWorker, None, 20, "worker-a", LEASE).await }),
        tokio::spawn(async move { store_b.acquire_jobs(JobKind::ExternalWorker, None, 20, "worker-b", LEASE).await }),
    );
    let a = a.unwrap().unwrap();
    let b = b.unwrap().unwrap();

    assert_eq!(a.len() + b.len(), 20);
    for job in &a {
        assert!(!b.iter().any(|other| other.id == job.id));
    }
}

#[test_log::test(tokio::test)]
async fn expired_lease_is_reclaimable_and_releases_are_owner_checked() {
    let h = harness(0);
    h.scheduler
        .schedule(ScheduleRequest::new(JobKind::ExternalWorker, "ok", json!({})))
        .await
        .unwrap();

    let job = claim_one(&h, JobKind::ExternalWorker).await;

    // A second claimer sees nothing while the lease is live.
    let other = h
        .store
        .acquire_jobs(JobKind::ExternalWorker, None, 1, "other", LEASE)
        .await
        .unwrap();
    assert!(other.is_empty());

    // A foreign release is a hard error, not a silent no-op.
    let err = h.store.release(job.id, "other").await.unwrap_err();
    assert!(matches!(err, StoreError::OwnershipConflict { .. }));

    // After expiry the job is claimable by anyone.
    h.clock.advance(LEASE + Duration::from_secs(1));
    let reclaimed = h
        .store
        .acquire_jobs(JobKind::ExternalWorker, None, 1, "other", LEASE)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].lock_owner.as_deref(), Some("other"));
}

#[test_log::test(tokio::test)]
async fn stale_owner_cannot_act_after_reclaim() {
    let h = harness(0);
    h.scheduler
        .schedule(ScheduleRequest::new(JobKind::ExternalWorker, "ok", json!({})))
        .await
        .unwrap();

    let job = claim_one(&h, JobKind::ExternalWorker).await;
    h.clock.advance(LEASE + Duration::from_secs(1));

    // Someone else reclaims; the original worker's dispatch must fail.
    let reclaimed = h
        .store
        .acquire_jobs(JobKind::ExternalWorker, None, 1, "other", LEASE)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);

    let err = h.dispatcher.execute(&job, WORKER).await.unwrap_err();
    assert!(matches!(
        err,
        jobflow::engine::DispatchError::Store(StoreError::OwnershipConflict { .. })
    ));
}

// =============================================================================
// Retries and dead-lettering
// =============================================================================

#[test_log::test(tokio::test)]
async fn transient_failures_burn_budget_then_succeed() {
    let h = harness(2);
    let id = h
        .scheduler
        .schedule(
            ScheduleRequest::new(JobKind::ExternalWorker, "flaky", json!({})).with_retries(3),
        )
        .await
        .unwrap();

    // First failure: budget 3 -> 2, lease cleared, exception recorded.
    let job = claim_one(&h, JobKind::ExternalWorker).await;
    let outcome = h.dispatcher.execute(&job, WORKER).await.unwrap();
    assert!(matches!(
        outcome,
        DispatchOutcome::Retried { retries_remaining: 2 }
    ));
    let requeued = h.store.find_by_id(id).await.unwrap();
    assert_eq!(requeued.retries_remaining, 2);
    assert!(requeued.lock_owner.is_none());
    assert!(requeued.exception_message.is_some());

    // Second failure, then success on the third run.
    h.clock.advance(Duration::from_secs(1));
    let job = claim_one(&h, JobKind::ExternalWorker).await;
    let outcome = h.dispatcher.execute(&job, WORKER).await.unwrap();
    assert!(matches!(
        outcome,
        DispatchOutcome::Retried { retries_remaining: 1 }
    ));

    h.clock.advance(Duration::from_secs(1));
    let job = claim_one(&h, JobKind::ExternalWorker).await;
    let outcome = h.dispatcher.execute(&job, WORKER).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Completed));
    assert!(h.store.find_by_id(id).await.is_err());
}

#[test_log::test(tokio::test)]
async fn exhausted_budget_dead_letters_and_reinstates() {
    let h = harness(u32::MAX);
    let id = h
        .scheduler
        .schedule(
            ScheduleRequest::new(JobKind::ExternalWorker, "flaky", json!({"order": 42}))
                .with_retries(2)
                .with_correlation_id("corr-dlq"),
        )
        .await
        .unwrap();

    for expected in [1u32, 0] {
        h.clock.advance(Duration::from_secs(1));
        let job = claim_one(&h, JobKind::ExternalWorker).await;
        let outcome = h.dispatcher.execute(&job, WORKER).await.unwrap();
        match expected {
            0 => assert!(matches!(outcome, DispatchOutcome::DeadLettered)),
            n => assert!(matches!(
                outcome,
                DispatchOutcome::Retried { retries_remaining } if retries_remaining == n
            )),
        }
    }

    // Gone from the live queue, present in the DLQ with the failure record.
    assert!(h.store.find_by_id(id).await.is_err());
    let dead = h.store.find_dead_letter(id).await.unwrap();
    assert_eq!(dead.retries_remaining, 0);
    assert!(dead.exception_message.is_some());

    // Reinstating mints a fresh id but keeps correlation and payload.
    let admin = JobAdmin::new(h.store.clone(), h.clock.clone());
    let new_id = admin.move_dead_letter_to_executable(id, 3).await.unwrap();
    assert_ne!(new_id, id);
    let revived = h.store.find_by_id(new_id).await.unwrap();
    assert_eq!(revived.correlation_id, "corr-dlq");
    assert_eq!(revived.payload, json!({"order": 42}));
    assert_eq!(revived.retries_remaining, 3);
    assert!(h.store.find_dead_letter(id).await.is_err());
}

#[test_log::test(tokio::test)]
async fn fatal_failure_skips_remaining_budget() {
    let h = harness(0);
    let id = h
        .scheduler
        .schedule(
            ScheduleRequest::new(JobKind::ExternalWorker, "poison", json!({})).with_retries(5),
        )
        .await
        .unwrap();

    let job = claim_one(&h, JobKind::ExternalWorker).await;
    let outcome = h.dispatcher.execute(&job, WORKER).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::DeadLettered));

    let dead = h.store.find_dead_letter(id).await.unwrap();
    assert_eq!(dead.retries_remaining, 0);
}

#[test_log::test(tokio::test)]
async fn unregistered_handler_type_dead_letters() {
    let h = harness(0);
    let id = h
        .scheduler
        .schedule(ScheduleRequest::new(JobKind::ExternalWorker, "nobody-home", json!({})))
        .await
        .unwrap();

    let job = claim_one(&h, JobKind::ExternalWorker).await;
    let outcome = h.dispatcher.execute(&job, WORKER).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::DeadLettered));

    let dead = h.store.find_dead_letter(id).await.unwrap();
    assert!(dead
        .exception_message
        .as_deref()
        .unwrap()
        .contains("no handler registered"));
}

// =============================================================================
// Timers
// =============================================================================

#[test_log::test(tokio::test)]
async fn timer_fires_into_continuation_and_executes() {
    let h = harness(0);
    let timer_id = h
        .scheduler
        .schedule(
            ScheduleRequest::new(JobKind::Timer, "ok", json!({"case": "c9"}))
                .with_due_date(h.clock.now() + TimeDelta::minutes(10))
                .with_correlation_id("corr-timer"),
        )
        .await
        .unwrap();

    let projector = TimerProjector::new(h.store.clone(), h.clock.clone());
    assert_eq!(projector.promote_due_timers().await.unwrap(), 0);

    h.clock.advance(Duration::from_secs(601));
    assert_eq!(projector.promote_due_timers().await.unwrap(), 1);
    assert!(h.store.find_by_id(timer_id).await.is_err());

    // The continuation is immediately executable by a normal worker.
    let job = claim_one(&h, JobKind::AsyncContinuation).await;
    assert_eq!(job.correlation_id, "corr-timer");
    let outcome = h.dispatcher.execute(&job, WORKER).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Completed));
    assert_eq!(h.store.live_count(), 0);
}

// =============================================================================
// History pipeline
// =============================================================================

fn case_event(
    event_type: HistoryEventType,
    entity_id: &str,
    fields: &CaseInstanceFields,
    at: chrono::DateTime<chrono::Utc>,
) -> ScheduleRequest {
    let event = HistoryEvent::new(event_type, entity_id, at)
        .with_fields(fields)
        .unwrap();
    ScheduleRequest::new(
        JobKind::HistoryEvent,
        HISTORY_JOB_HANDLER_TYPE,
        event.to_payload().unwrap(),
    )
    .with_correlation_id(entity_id)
}

#[test_log::test(tokio::test)]
async fn duplicate_history_delivery_is_idempotent() {
    let h = harness(0);
    let t = h.clock.now();

    let fields = CaseInstanceFields {
        name: Some("Order".to_string()),
        state: Some("active".to_string()),
        ..Default::default()
    };
    // The same logical event delivered twice as two jobs.
    for _ in 0..2 {
        h.scheduler
            .schedule(case_event(HistoryEventType::CaseInstanceStart, "c1", &fields, t))
            .await
            .unwrap();
    }

    drain(&h, JobKind::HistoryEvent).await;

    assert_eq!(h.history.case_instance_count(), 1);
    let case = h.history.get_case_instance("c1").await.unwrap().unwrap();
    assert_eq!(case.name.as_deref(), Some("Order"));
    assert_eq!(case.last_updated_time, Some(t));
}

#[test_log::test(tokio::test)]
async fn out_of_order_history_converges() {
    let h = harness(0);
    let t0 = h.clock.now();
    let t1 = t0 + TimeDelta::seconds(10);
    let t2 = t0 + TimeDelta::seconds(20);

    // Deliver end first, then an update, then the start. The end and
    // update jobs requeue until the start lands; after that the newest
    // timestamp wins and anything older is discarded.
    h.scheduler
        .schedule(case_event(
            HistoryEventType::CaseInstanceEnd,
            "c1",
            &CaseInstanceFields {
                end_time: Some(t2),
                ..Default::default()
            },
            t2,
        ))
        .await
        .unwrap();
    h.scheduler
        .schedule(case_event(
            HistoryEventType::CaseInstanceUpdate,
            "c1",
            &CaseInstanceFields {
                business_key: Some("bk-77".to_string()),
                ..Default::default()
            },
            t1,
        ))
        .await
        .unwrap();
    h.scheduler
        .schedule(case_event(
            HistoryEventType::CaseInstanceStart,
            "c1",
            &CaseInstanceFields {
                name: Some("Order".to_string()),
                state: Some("active".to_string()),
                start_time: Some(t0),
                ..Default::default()
            },
            t0,
        ))
        .await
        .unwrap();

    drain(&h, JobKind::HistoryEvent).await;

    let case = h.history.get_case_instance("c1").await.unwrap().unwrap();
    assert_eq!(case.name.as_deref(), Some("Order"));
    assert_eq!(case.start_time, Some(t0));
    assert_eq!(case.end_time, Some(t2));
    assert_eq!(case.state.as_deref(), Some("completed"));
    assert_eq!(case.last_updated_time, Some(t2));
    // The end event raised the high-water mark to t2 before the t1
    // update got another turn, so the older update was discarded; its
    // job completed instead of retrying forever.
    assert!(case.business_key.is_none());
    assert_eq!(h.store.live_count(), 0);
    assert_eq!(h.store.dead_letter_count(), 0);
}

#[test_log::test(tokio::test)]
async fn stale_history_event_never_regresses_state() {
    let h = harness(0);
    let t0 = h.clock.now();
    let t1 = t0 + TimeDelta::seconds(10);

    h.scheduler
        .schedule(case_event(
            HistoryEventType::CaseInstanceStart,
            "c1",
            &CaseInstanceFields {
                name: Some("Order".to_string()),
                ..Default::default()
            },
            t0,
        ))
        .await
        .unwrap();
    h.scheduler
        .schedule(case_event(
            HistoryEventType::CaseInstanceUpdate,
            "c1",
            &CaseInstanceFields {
                name: Some("Order v2".to_string()),
                ..Default::default()
            },
            t1,
        ))
        .await
        .unwrap();
    drain(&h, JobKind::HistoryEvent).await;

    // A very late update with an old timestamp is discarded, and its job
    // still completes rather than retrying forever.
    h.scheduler
        .schedule(case_event(
            HistoryEventType::CaseInstanceUpdate,
            "c1",
            &CaseInstanceFields {
                name: Some("Order v0".to_string()),
                ..Default::default()
            },
            t0 - TimeDelta::seconds(5),
        ))
        .await
        .unwrap();
    drain(&h, JobKind::HistoryEvent).await;

    let case = h.history.get_case_instance("c1").await.unwrap().unwrap();
    assert_eq!(case.name.as_deref(), Some("Order v2"));
    assert_eq!(h.store.live_count(), 0);
    assert_eq!(h.store.dead_letter_count(), 0);
}

#[test_log::test(tokio::test)]
async fn case_lifecycle_with_tasks_and_delete() {
    let h = harness(0);
    let t0 = h.clock.now();
    let t1 = t0 + TimeDelta::seconds(1);
    let t2 = t0 + TimeDelta::seconds(2);

    h.scheduler
        .schedule(case_event(
            HistoryEventType::CaseInstanceStart,
            "c1",
            &CaseInstanceFields {
                name: Some("Order".to_string()),
                ..Default::default()
            },
            t0,
        ))
        .await
        .unwrap();

    let task_event = HistoryEvent::new(HistoryEventType::TaskCreate, "t1", t1)
        .with_case_instance("c1")
        .with_fields(&TaskFields {
            name: Some("Review".to_string()),
            state: Some("created".to_string()),
            ..Default::default()
        })
        .unwrap();
    h.scheduler
        .schedule(ScheduleRequest::new(
            JobKind::HistoryEvent,
            HISTORY_JOB_HANDLER_TYPE,
            task_event.to_payload().unwrap(),
        ))
        .await
        .unwrap();
    drain(&h, JobKind::HistoryEvent).await;

    assert_eq!(h.history.task_count(), 1);

    // Deleting the case takes its task with it.
    let delete = HistoryEvent::new(HistoryEventType::CaseInstanceDelete, "c1", t2);
    h.scheduler
        .schedule(ScheduleRequest::new(
            JobKind::HistoryEvent,
            HISTORY_JOB_HANDLER_TYPE,
            delete.to_payload().unwrap(),
        ))
        .await
        .unwrap();
    drain(&h, JobKind::HistoryEvent).await;

    assert_eq!(h.history.case_instance_count(), 0);
    assert_eq!(h.history.task_count(), 0);
}

// =============================================================================
// Worker lifecycle against the engine
// =============================================================================

#[test_log::test(tokio::test)]
async fn worker_processes_history_jobs_end_to_end() {
    let clock: Arc<ManualClock> = Arc::new(ManualClock::starting_now());
    let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
    let history = Arc::new(InMemoryHistoryStore::new());

    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(HistoryJobHandler::new(history.clone())));
    let retry = Arc::new(RetryHandler::new(
        store.clone(),
        clock.clone(),
        RetryPolicy::immediate(3),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        Arc::new(registry),
        retry,
        clock.clone(),
    ));

    let event = HistoryEvent::new(HistoryEventType::CaseInstanceStart, "c1", clock.now())
        .with_fields(&CaseInstanceFields {
            name: Some("Order".to_string()),
            ..Default::default()
        })
        .unwrap();
    JobScheduler::new(store.clone())
        .schedule(ScheduleRequest::new(
            JobKind::HistoryEvent,
            HISTORY_JOB_HANDLER_TYPE,
            event.to_payload().unwrap(),
        ))
        .await
        .unwrap();

    let worker = JobWorker::new(
        store.clone(),
        dispatcher,
        clock.clone(),
        JobWorkerConfig::new(JobKind::HistoryEvent)
            .with_worker_id("history-worker")
            .with_poller(PollerConfig::default().with_min_interval(Duration::from_millis(10))),
    );
    worker.start().unwrap();

    for _ in 0..100 {
        if store.live_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    worker.shutdown().await.unwrap();

    assert_eq!(store.live_count(), 0);
    assert!(history.get_case_instance("c1").await.unwrap().is_some());
}
