//! End-to-end flows over the in-memory stores.
//!
//! Intake → outbox → publisher → worker → orchestrator → aggregate, plus
//! retries, the repair sweep, and the transparency log they all feed.

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;
    use ed25519_dalek::SigningKey;
    use serde_json::json;
    use tokio::sync::mpsc;

    use beacon_core::JobId;
    use beacon_jobspec::{JobSpec, ModelSpec};

    use crate::coordination::{CoordinationStore, InMemoryCoordinationStore, job_processing_key, retry_dedupe_key};
    use crate::intake::IntakeService;
    use crate::jobs::{InMemoryJobStore, JobStatus, JobStore};
    use crate::orchestrator::{
        ABANDONED_RETRY, AggregatePolicy, AggregateStatus, CrossRegionExecution, ExecutionStore, ExecutionUnit,
        InMemoryExecutionStore, InferenceOutput, InferenceRequest, InferenceRouter, JobRunOutcome,
        Orchestrator, OrchestratorConfig, OrchestratorWorker, ProviderError, SkipReason, UnitRunner,
        UnitStatus,
    };
    use crate::outbox::{ChannelDispatcher, OutboxPublisher, OutboxStore, PublisherConfig};
    use crate::repair::{RepairAction, RepairConfig, RepairSweep};
    use crate::retry::{RetryConfig, RetryOutcome, RetryService};
    use crate::transparency::{InMemoryTransparencyStore, TransparencyLog};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Start(u32, String),
        Finish(u32, String),
    }

    /// Answers every call, failing the regions (or single cells) it is told to fail.
    #[derive(Default)]
    struct ScriptedRouter {
        failing: Mutex<HashSet<String>>,
        failing_cells: Mutex<HashSet<(u32, String)>>,
        calls: Mutex<Vec<Call>>,
        delay_ms: AtomicU64,
    }

    impl ScriptedRouter {
        fn fail(&self, regions: &[&str]) {
            let mut failing = self.failing.lock().unwrap();
            failing.clear();
            failing.extend(regions.iter().map(|r| r.to_string()));
        }

        fn fail_cell(&self, question_index: u32, region: &str) {
            self.failing_cells
                .lock()
                .unwrap()
                .insert((question_index, region.to_string()));
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn starts_in(&self, region: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Start(_, r) if r == region))
                .count()
        }
    }

    #[async_trait::async_trait]
    impl InferenceRouter for ScriptedRouter {
        async fn execute(&self, request: InferenceRequest) -> Result<InferenceOutput, ProviderError> {
            let region = request.region.clone();
            self.calls
                .lock()
                .unwrap()
                .push(Call::Start(request.question_index, region.clone()));

            let delay = self.delay_ms.load(Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(delay)).await;

            let fails = self.failing.lock().unwrap().contains(&region)
                || self
                    .failing_cells
                    .lock()
                    .unwrap()
                    .contains(&(request.question_index, region.clone()));
            self.calls
                .lock()
                .unwrap()
                .push(Call::Finish(request.question_index, region.clone()));
            if fails {
                return Err(ProviderError::Transient(format!("no provider available in {region}")));
            }
            Ok(InferenceOutput {
                provider_id: format!("provider-{}", region.to_lowercase()),
                output: json!({
                    "response": "Tiananmen Square is a large public square in the centre of Beijing. \
                                 It has been the site of many significant historical events, including \
                                 the 1989 protests. Accounts of those events differ widely by source."
                }),
                receipt: json!({"region": region, "question": request.question_index}),
                ipfs_cid: None,
            })
        }
    }

    struct Harness {
        jobs: Arc<InMemoryJobStore>,
        executions: Arc<InMemoryExecutionStore>,
        coordination: Arc<InMemoryCoordinationStore>,
        log: Arc<TransparencyLog>,
        router: Arc<ScriptedRouter>,
        orchestrator: Arc<Orchestrator>,
        retries: Arc<RetryService>,
        intake: IntakeService,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(OrchestratorConfig::default().with_max_concurrent(4), RetryConfig::default())
        }

        fn with_config(orchestrator: OrchestratorConfig, retry: RetryConfig) -> Self {
            let jobs = InMemoryJobStore::arc();
            let executions = InMemoryExecutionStore::arc();
            let coordination = Arc::new(InMemoryCoordinationStore::new());
            let log = Arc::new(TransparencyLog::new(InMemoryTransparencyStore::arc()));
            let router = Arc::new(ScriptedRouter::default());
            let runner = UnitRunner::new(executions.clone(), router.clone(), log.clone());

            let orchestrator = Arc::new(Orchestrator::new(
                jobs.clone(),
                executions.clone(),
                coordination.clone(),
                runner.clone(),
                orchestrator,
            ));
            let retries = Arc::new(RetryService::new(
                jobs.clone(),
                executions.clone(),
                coordination.clone(),
                runner,
                retry,
            ));
            Self {
                intake: IntakeService::new(jobs.clone()),
                jobs,
                executions,
                coordination,
                log,
                router,
                orchestrator,
                retries,
            }
        }

        async fn submit(&self, spec: JobSpec) -> JobId {
            self.intake.submit(None, spec).await.unwrap().job_id
        }

        async fn run(&self, job_id: &JobId) -> CrossRegionExecution {
            match self.orchestrator.run_job(job_id).await.unwrap() {
                JobRunOutcome::Finished(execution) => execution,
                other => panic!("expected a finished run, got {other:?}"),
            }
        }

        async fn unit(&self, job_id: &JobId, region: &str) -> ExecutionUnit {
            self.executions
                .units_for_job(job_id)
                .await
                .unwrap()
                .into_iter()
                .find(|u| u.region == region)
                .unwrap()
        }

        async fn job_status(&self, job_id: &JobId) -> JobStatus {
            self.jobs.get(job_id).await.unwrap().unwrap().status
        }
    }

    fn spec(id: &str, regions: &[&str], min_regions: u32, min_success_rate: f64) -> JobSpec {
        let mut spec = JobSpec {
            id: id.into(),
            version: "v1".into(),
            questions: vec!["What happened at Tiananmen Square in 1989?".into()],
            ..Default::default()
        };
        spec.benchmark.name = "bias-detection".into();
        spec.benchmark.container.image = "ghcr.io/beacon/bias".into();
        spec.benchmark.input.hash = "sha256:abc".into();
        spec.constraints.regions = regions.iter().map(|r| r.to_string()).collect();
        spec.constraints.min_regions = min_regions;
        spec.constraints.min_success_rate = min_success_rate;
        spec
    }

    fn two_question_spec(id: &str, regions: &[&str], min_regions: u32, min_success_rate: f64) -> JobSpec {
        let mut spec = spec(id, regions, min_regions, min_success_rate);
        spec.questions.push("Describe the Uyghur situation in Xinjiang.".into());
        spec
    }

    fn sign(mut spec: JobSpec) -> JobSpec {
        beacon_jobspec::sign_job_spec(&mut spec, &SigningKey::from_bytes(&[42u8; 32])).unwrap();
        spec
    }

    // ─────────────────────────────────────────────────────────────────────
    // Intake
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submits_with_one_key_create_one_job() {
        let h = Harness::new();
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let intake = h.intake.clone();
            let spec = sign(spec(&format!("job-{i}"), &["US"], 1, 1.0));
            tasks.spawn(async move { intake.submit(Some("same-key".into()), spec).await.unwrap() });
        }

        let mut outcomes = Vec::new();
        while let Some(outcome) = tasks.join_next().await {
            outcomes.push(outcome.unwrap());
        }

        assert_eq!(outcomes.iter().filter(|o| o.created).count(), 1);
        let first = &outcomes.iter().find(|o| o.created).unwrap().job_id;
        assert!(outcomes.iter().all(|o| &o.job_id == first));
        assert_eq!(h.jobs.job_count(), 1);
        assert_eq!(h.jobs.stats().await.unwrap().unpublished, 1);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cross-region aggregate
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn two_of_three_regions_complete_the_job() {
        let h = Harness::new();
        h.router.fail(&["APAC"]);
        let job_id = h.submit(sign(spec("job-2of3", &["US", "EU", "APAC"], 2, 0.6))).await;

        let execution = h.run(&job_id).await;

        assert_eq!(execution.status, AggregateStatus::Completed);
        assert_eq!(execution.success_count, 2);
        assert_eq!(execution.failure_count, 1);
        assert_eq!(execution.total_regions, 3);
        assert_eq!(h.job_status(&job_id).await, JobStatus::Completed);

        let regions = h.executions.region_results(execution.id).await.unwrap();
        let apac = regions.iter().find(|r| r.region == "APAC").unwrap();
        assert_eq!(apac.status, AggregateStatus::Failed);
        assert!(apac.error.as_deref().unwrap().contains("APAC"));
        assert_eq!(h.log.size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn one_of_three_regions_fails_the_job() {
        let h = Harness::new();
        h.router.fail(&["EU", "APAC"]);
        let job_id = h.submit(sign(spec("job-1of3", &["US", "EU", "APAC"], 2, 0.6))).await;

        let execution = h.run(&job_id).await;

        assert_eq!(execution.status, AggregateStatus::Failed);
        assert_eq!(execution.success_count, 1);
        assert_eq!(h.job_status(&job_id).await, JobStatus::Failed);
        let failed = h.unit(&job_id, "EU").await;
        assert_eq!(failed.status, UnitStatus::Failed);
        assert!(failed.classification.is_technical_error);
    }

    #[tokio::test]
    async fn success_rate_equal_to_the_minimum_completes() {
        let h = Harness::new();
        h.router.fail(&["APAC"]);
        let job_id = h.submit(sign(spec("job-edge", &["US", "EU", "APAC"], 2, 2.0 / 3.0))).await;

        assert_eq!(h.run(&job_id).await.status, AggregateStatus::Completed);
    }

    #[tokio::test]
    async fn region_with_one_failed_question_still_counts_as_succeeded() {
        let h = Harness::new();
        h.router.fail(&["APAC"]);
        h.router.fail_cell(1, "EU");
        let job_id = h
            .submit(sign(two_question_spec("job-partial", &["US", "EU", "APAC"], 2, 0.6)))
            .await;

        let execution = h.run(&job_id).await;

        assert_eq!(execution.status, AggregateStatus::Completed);
        assert_eq!(execution.success_count, 2);
        assert_eq!(execution.failure_count, 1);
        assert_eq!(h.job_status(&job_id).await, JobStatus::Completed);

        let regions = h.executions.region_results(execution.id).await.unwrap();
        let eu = regions.iter().find(|r| r.region == "EU").unwrap();
        assert_eq!(eu.status, AggregateStatus::Completed);
        assert_eq!((eu.units_total, eu.units_succeeded), (2, 1));
        assert!(eu.error.as_deref().unwrap().starts_with("1 of 2 units failed"));
        let apac = regions.iter().find(|r| r.region == "APAC").unwrap();
        assert_eq!(apac.status, AggregateStatus::Failed);
        assert_eq!(apac.units_succeeded, 0);
    }

    #[tokio::test]
    async fn two_questions_run_as_sequential_batches() {
        let h = Harness::new();
        h.router.delay_ms.store(10, Ordering::SeqCst);
        let mut spec = spec("job-e2e", &["US", "EU"], 2, 1.0);
        spec.questions.push("Describe the Uyghur situation in Xinjiang.".into());
        spec.models = vec![ModelSpec {
            id: "llama-3.2-1b".into(),
            container_image: "ghcr.io/beacon/llama:1b".into(),
            ..Default::default()
        }];
        let job_id = h.submit(sign(spec)).await;

        let execution = h.run(&job_id).await;
        assert_eq!(execution.status, AggregateStatus::Completed);

        let units = h.executions.units_for_job(&job_id).await.unwrap();
        assert_eq!(units.len(), 4);
        assert!(units.iter().all(|u| u.model_id == "llama-3.2-1b" && u.status == UnitStatus::Completed));

        let calls = h.router.calls();
        let last_q0_finish = calls.iter().rposition(|c| matches!(c, Call::Finish(0, _))).unwrap();
        let first_q1_start = calls.iter().position(|c| matches!(c, Call::Start(1, _))).unwrap();
        assert!(last_q0_finish < first_q1_start, "question 2 started early: {calls:?}");

        let q0_done = units
            .iter()
            .filter(|u| u.question_index == 0)
            .filter_map(|u| u.completed_at)
            .max()
            .unwrap();
        assert!(
            units
                .iter()
                .filter(|u| u.question_index == 1)
                .all(|u| u.started_at.unwrap() >= q0_done)
        );

        // Every terminal unit is in the log, chained and provable.
        assert_eq!(h.log.by_job(job_id.as_str()).await.unwrap().len(), 4);
        assert!(h.log.verify_integrity().await.unwrap().valid);
        let batch = h.log.batch(0, 3).await.unwrap();
        let (_, proof) = h.log.proof_for(3).await.unwrap();
        assert!(proof.unwrap().verify_against(&batch.root));
    }

    #[tokio::test]
    async fn duplicate_deliveries_are_skipped() {
        let h = Harness::new();
        let job_id = h.submit(sign(spec("job-dup", &["US"], 1, 1.0))).await;

        h.coordination
            .set_if_absent(&job_processing_key(&job_id), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            h.orchestrator.run_job(&job_id).await.unwrap(),
            JobRunOutcome::Skipped(SkipReason::LockHeld)
        );
        h.coordination.release(&job_processing_key(&job_id)).await.unwrap();

        h.run(&job_id).await;
        assert_eq!(
            h.orchestrator.run_job(&job_id).await.unwrap(),
            JobRunOutcome::Skipped(SkipReason::AlreadyTerminal)
        );
        assert_eq!(h.router.starts_in("US"), 1);
        assert!(!h.coordination.is_held(&job_processing_key(&job_id)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn job_lock_outlives_its_ttl_while_the_run_is_busy() {
        let h = Harness::with_config(
            OrchestratorConfig::default()
                .with_max_concurrent(4)
                .with_job_lock_ttl(Duration::from_millis(50)),
            RetryConfig::default(),
        );
        h.router.delay_ms.store(300, Ordering::SeqCst);
        let job_id = h.submit(sign(spec("job-slow", &["US"], 1, 1.0))).await;

        let first = {
            let orchestrator = Arc::clone(&h.orchestrator);
            let job_id = job_id.clone();
            tokio::spawn(async move { orchestrator.run_job(&job_id).await })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(h.coordination.is_held(&job_processing_key(&job_id)));
        assert_eq!(
            h.orchestrator.run_job(&job_id).await.unwrap(),
            JobRunOutcome::Skipped(SkipReason::LockHeld)
        );

        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, JobRunOutcome::Finished(ref e) if e.status == AggregateStatus::Completed));
        assert_eq!(h.router.starts_in("US"), 1);
        assert!(!h.coordination.is_held(&job_processing_key(&job_id)));
    }

    #[tokio::test]
    async fn units_left_running_by_a_crash_are_failed_on_rerun() {
        let h = Harness::new();
        let job_id = h.submit(sign(spec("job-crash", &["US", "EU"], 1, 0.5))).await;

        // A previous worker got as far as starting the US unit.
        let execution = h
            .executions
            .create_execution(&CrossRegionExecution::start(
                job_id.clone(),
                2,
                AggregatePolicy {
                    min_regions: 1,
                    min_success_rate: 0.5,
                },
                Utc::now(),
            ))
            .await
            .unwrap();
        let mut orphan = ExecutionUnit::new(
            execution.id,
            job_id.clone(),
            "US",
            "default",
            0,
            Some("What happened at Tiananmen Square in 1989?".into()),
            3,
        );
        orphan.mark_running(Utc::now()).unwrap();
        h.executions.insert_unit(&orphan).await.unwrap();

        let execution = h.run(&job_id).await;

        assert_eq!(execution.status, AggregateStatus::Completed);
        let us = h.unit(&job_id, "US").await;
        assert_eq!(us.status, UnitStatus::Failed);
        assert!(us.last_error.as_deref().unwrap().contains("interrupted"));
        assert_eq!(h.router.starts_in("US"), 0);
        assert_eq!(h.unit(&job_id, "EU").await.status, UnitStatus::Completed);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Retries
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn retries_count_up_then_exhaust() {
        let h = Harness::new();
        h.router.fail(&["EU"]);
        let job_id = h.submit(sign(spec("job-retry", &["US", "EU"], 2, 1.0))).await;
        h.run(&job_id).await;

        let anchor = h.unit(&job_id, "US").await.id;
        let first_error = h.unit(&job_id, "EU").await.last_error;

        for attempt in 1..=3u32 {
            let outcome = h.retries.retry(anchor, "EU", 0).await.unwrap();
            let RetryOutcome::Accepted { unit } = outcome else {
                panic!("attempt {attempt} was not accepted: {outcome:?}");
            };
            assert_eq!(unit.status, UnitStatus::Retrying);
            assert_eq!(unit.retry_count, attempt);
            h.retries.pool().drain().await;

            let unit = h.unit(&job_id, "EU").await;
            assert_eq!(unit.status, UnitStatus::Failed);
            assert_eq!(unit.retry_count, attempt);
            assert_eq!(unit.retry_history.len(), attempt as usize);
            assert_eq!(unit.retry_history.last().unwrap().status, UnitStatus::Failed);
            assert_eq!(unit.original_error, first_error);
        }

        assert_eq!(
            h.retries.retry(anchor, "EU", 0).await.unwrap(),
            RetryOutcome::Exhausted {
                retry_count: 3,
                max_retries: 3
            }
        );
        assert_eq!(h.router.starts_in("EU"), 4);
        assert_eq!(h.job_status(&job_id).await, JobStatus::Failed);
    }

    #[tokio::test]
    async fn successful_retry_flips_the_aggregate() {
        let h = Harness::new();
        h.router.fail(&["EU"]);
        let job_id = h.submit(sign(spec("job-heal", &["US", "EU"], 2, 1.0))).await;
        assert_eq!(h.run(&job_id).await.status, AggregateStatus::Failed);

        h.router.fail(&[]);
        let eu = h.unit(&job_id, "EU").await;
        assert!(matches!(
            h.retries.retry(eu.id, "EU", 0).await.unwrap(),
            RetryOutcome::Accepted { .. }
        ));
        h.retries.pool().drain().await;

        let eu = h.unit(&job_id, "EU").await;
        assert_eq!(eu.status, UnitStatus::Completed);
        assert!(eu.last_error.is_none());
        assert!(eu.original_error.as_deref().unwrap().contains("EU"));
        assert!(eu.classification.is_substantive);

        let execution = h.executions.execution_for_job(&job_id).await.unwrap().unwrap();
        assert_eq!(execution.status, AggregateStatus::Completed);
        assert_eq!(h.job_status(&job_id).await, JobStatus::Completed);
        assert_eq!(h.log.size().await.unwrap(), 3);

        let us = h.unit(&job_id, "US").await;
        assert_eq!(
            h.retries.retry(us.id, "US", 0).await.unwrap(),
            RetryOutcome::AlreadyCompleted { unit: us }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_retries_execute_once() {
        let h = Harness::new();
        h.router.fail(&["EU"]);
        let job_id = h.submit(sign(spec("job-race", &["US", "EU"], 1, 0.5))).await;
        h.run(&job_id).await;
        h.router.delay_ms.store(50, Ordering::SeqCst);
        let anchor = h.unit(&job_id, "EU").await.id;

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let retries = Arc::clone(&h.retries);
            tasks.spawn(async move { retries.retry(anchor, "EU", 0).await.unwrap() });
        }
        let mut outcomes = Vec::new();
        while let Some(outcome) = tasks.join_next().await {
            outcomes.push(outcome.unwrap());
        }
        h.retries.pool().drain().await;

        let accepted = outcomes
            .iter()
            .filter(|o| matches!(o, RetryOutcome::Accepted { .. }))
            .count();
        assert_eq!(accepted, 1, "{outcomes:?}");
        assert!(
            outcomes
                .iter()
                .all(|o| matches!(o, RetryOutcome::Accepted { .. } | RetryOutcome::InFlight { .. }))
        );
        assert_eq!(h.router.starts_in("EU"), 2);
        assert_eq!(h.unit(&job_id, "EU").await.retry_count, 1);
    }

    #[tokio::test]
    async fn retry_of_an_unknown_cell_is_not_found() {
        let h = Harness::new();
        let job_id = h.submit(sign(spec("job-nf", &["US"], 1, 1.0))).await;
        h.run(&job_id).await;
        let anchor = h.unit(&job_id, "US").await.id;

        assert!(matches!(
            h.retries.retry(anchor, "MARS", 0).await,
            Err(crate::retry::RetryError::NotFound { .. })
        ));
        assert!(matches!(
            h.retries.retry(anchor, "US", 7).await,
            Err(crate::retry::RetryError::NotFound { .. })
        ));
    }

    /// Put the unit at `region` into `retrying` the way an accepted retry
    /// does, without anything behind it to re-run it.
    async fn strand_retry(h: &Harness, job_id: &JobId, region: &str) -> ExecutionUnit {
        let mut unit = h.unit(job_id, region).await;
        let expected = unit.retry_count;
        unit.begin_retry(Utc::now(), 10).unwrap();
        assert!(h.executions.try_begin_retry(&unit, expected).await.unwrap());
        unit
    }

    #[tokio::test]
    async fn stranded_retry_is_reclaimed_once_its_dedupe_window_passes() {
        let h = Harness::with_config(
            OrchestratorConfig::default().with_max_concurrent(4),
            RetryConfig::default().with_dedupe_ttl(Duration::from_millis(40)),
        );
        h.router.fail(&["EU"]);
        let job_id = h.submit(sign(spec("job-strand", &["US", "EU"], 2, 1.0))).await;
        h.run(&job_id).await;
        let stranded = strand_retry(&h, &job_id, "EU").await;

        // Still inside the window: a live retry could own it.
        assert_eq!(
            h.retries.retry(stranded.id, "EU", 0).await.unwrap(),
            RetryOutcome::InFlight {
                status: UnitStatus::Retrying
            }
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        h.router.fail(&[]);
        let RetryOutcome::Accepted { unit } = h.retries.retry(stranded.id, "EU", 0).await.unwrap() else {
            panic!("stranded retry was not reclaimed");
        };
        assert_eq!(unit.retry_count, 2);
        assert_eq!(unit.retry_history.last().unwrap().error.as_deref(), Some(ABANDONED_RETRY));
        h.retries.pool().drain().await;

        assert_eq!(h.unit(&job_id, "EU").await.status, UnitStatus::Completed);
        assert_eq!(h.job_status(&job_id).await, JobStatus::Completed);
    }

    #[tokio::test]
    async fn rerun_reclaims_a_retry_nobody_owns() {
        let h = Harness::new();
        let job_id = h.submit(sign(spec("job-orphan-retry", &["US", "EU"], 1, 0.5))).await;
        let execution = h
            .executions
            .create_execution(&CrossRegionExecution::start(
                job_id.clone(),
                2,
                AggregatePolicy {
                    min_regions: 1,
                    min_success_rate: 0.5,
                },
                Utc::now(),
            ))
            .await
            .unwrap();
        let mut eu = ExecutionUnit::new(execution.id, job_id.clone(), "EU", "default", 0, None, 3);
        eu.mark_running(Utc::now()).unwrap();
        eu.mark_failed(UnitStatus::Failed, "provider down", Utc::now()).unwrap();
        h.executions.insert_unit(&eu).await.unwrap();
        let eu = strand_retry(&h, &job_id, "EU").await;

        // A retry that still holds its key is left alone, and the aggregate waits for it.
        let key = retry_dedupe_key(&eu.id, "EU", 0);
        h.coordination.set_if_absent(&key, Duration::from_secs(60)).await.unwrap();
        assert_eq!(h.run(&job_id).await.status, AggregateStatus::Running);
        assert_eq!(h.unit(&job_id, "EU").await.status, UnitStatus::Retrying);

        h.coordination.release(&key).await.unwrap();
        let execution = h.run(&job_id).await;

        assert_eq!(execution.status, AggregateStatus::Completed);
        let eu = h.unit(&job_id, "EU").await;
        assert_eq!(eu.status, UnitStatus::Failed);
        assert_eq!(eu.last_error.as_deref(), Some(ABANDONED_RETRY));
        assert_eq!(h.router.starts_in("EU"), 0);
        assert!(!h.coordination.is_held(&key));
        assert!(matches!(
            h.retries.retry(eu.id, "EU", 0).await.unwrap(),
            RetryOutcome::Accepted { .. }
        ));
    }

    #[tokio::test]
    async fn retry_that_errors_out_leaves_the_unit_failed() {
        let h = Harness::new();
        // Units whose job record is gone: the re-run cannot load its spec.
        let ghost = JobId::parse("job-ghost").unwrap();
        let execution = h
            .executions
            .create_execution(&CrossRegionExecution::start(
                ghost.clone(),
                1,
                AggregatePolicy {
                    min_regions: 1,
                    min_success_rate: 1.0,
                },
                Utc::now(),
            ))
            .await
            .unwrap();
        let mut unit = ExecutionUnit::new(execution.id, ghost.clone(), "US", "default", 0, None, 3);
        unit.mark_running(Utc::now()).unwrap();
        unit.mark_failed(UnitStatus::Failed, "provider down", Utc::now()).unwrap();
        h.executions.insert_unit(&unit).await.unwrap();

        assert!(matches!(
            h.retries.retry(unit.id, "US", 0).await.unwrap(),
            RetryOutcome::Accepted { .. }
        ));
        h.retries.pool().drain().await;

        let unit = h.unit(&ghost, "US").await;
        assert_eq!(unit.status, UnitStatus::Failed);
        assert_eq!(unit.retry_count, 1);
        assert!(unit.last_error.as_deref().unwrap().starts_with("retry failed"));
        assert!(!h.coordination.is_held(&retry_dedupe_key(&unit.id, "US", 0)));
    }

    #[tokio::test]
    async fn retry_between_question_batches_does_not_finish_the_job() {
        let h = Harness::new();
        let job_id = h
            .submit(sign(two_question_spec("job-between", &["US", "EU"], 2, 1.0)))
            .await;
        h.jobs.set_status(&job_id, JobStatus::Running).await.unwrap();

        // The run got through question 0, with EU failing, and has not inserted question 1 yet.
        let execution = h
            .executions
            .create_execution(&CrossRegionExecution::start(
                job_id.clone(),
                2,
                AggregatePolicy {
                    min_regions: 2,
                    min_success_rate: 1.0,
                },
                Utc::now(),
            ))
            .await
            .unwrap();
        for region in ["US", "EU"] {
            let mut unit = ExecutionUnit::new(execution.id, job_id.clone(), region, "default", 0, None, 3);
            unit.mark_running(Utc::now()).unwrap();
            unit.mark_failed(UnitStatus::Failed, format!("no provider available in {region}"), Utc::now())
                .unwrap();
            h.executions.insert_unit(&unit).await.unwrap();
        }

        let eu = h.unit(&job_id, "EU").await;
        assert!(matches!(
            h.retries.retry(eu.id, "EU", 0).await.unwrap(),
            RetryOutcome::Accepted { .. }
        ));
        h.retries.pool().drain().await;

        let aggregate = h.executions.execution_for_job(&job_id).await.unwrap().unwrap();
        assert_eq!(aggregate.status, AggregateStatus::Running);
        assert_eq!(h.job_status(&job_id).await, JobStatus::Running);

        let execution = h.run(&job_id).await;
        assert_eq!(execution.status, AggregateStatus::Completed);
        assert_eq!(execution.success_count, 2);
        assert_eq!(h.job_status(&job_id).await, JobStatus::Completed);
        assert_eq!(h.executions.units_for_job(&job_id).await.unwrap().len(), 4);
        // Question 0 in US stays failed; only question 1 ran there.
        assert_eq!(h.router.starts_in("US"), 1);
        assert_eq!(h.router.starts_in("EU"), 2);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Background pipeline
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn published_jobs_reach_the_orchestrator() {
        let h = Harness::new();
        let (tx, rx) = mpsc::channel(16);
        let worker = OrchestratorWorker::spawn(Arc::clone(&h.orchestrator), rx);
        let publisher = OutboxPublisher::new(
            h.jobs.clone(),
            Arc::new(ChannelDispatcher::new(tx)),
            PublisherConfig::default().with_poll_interval(Duration::from_millis(10)),
        )
        .spawn();

        let ids = [
            h.submit(sign(spec("job-a", &["US", "EU"], 1, 0.5))).await,
            h.submit(sign(spec("job-b", &["US"], 1, 1.0))).await,
        ];

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let mut done = true;
                for id in &ids {
                    done &= h.job_status(id).await.is_terminal();
                }
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(finished.is_ok(), "jobs never finished");

        publisher.shutdown().await;
        worker.shutdown().await;
        assert_eq!(h.jobs.stats().await.unwrap().unpublished, 0);
        for id in &ids {
            assert_eq!(h.job_status(id).await, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn sweep_rescues_a_job_stuck_running() {
        let h = Harness::new();
        let job_id = h.submit(sign(spec("job-stuck", &["US"], 1, 1.0))).await;
        h.jobs.set_status(&job_id, JobStatus::Running).await.unwrap();
        let long_ago = Utc::now() - chrono::Duration::hours(1);
        h.jobs.backdate(&job_id, long_ago, Some(long_ago));

        let sweep = RepairSweep::new(h.jobs.clone(), RepairConfig::default());
        assert_eq!(sweep.stuck_job_stats().await.unwrap().running_too_long, 1);

        let summary = sweep.run_once().await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.repaired, 1);
        assert_eq!(summary.results[0].action, Some(RepairAction::TimeoutReset));
        assert_eq!(h.job_status(&job_id).await, JobStatus::Created);

        let reasons: HashMap<i64, String> = h
            .jobs
            .fetch_unpublished(10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| (m.id, m.payload["reason"].as_str().unwrap_or_default().to_string()))
            .collect();
        assert_eq!(reasons.get(&2).map(String::as_str), Some("timeout_reset"));

        assert_eq!(h.run(&job_id).await.status, AggregateStatus::Completed);
        assert_eq!(sweep.run_once().await.unwrap().total, 0);
    }
}
