//! Job worker: claims jobs from the store and drives each one a single step
//! through its lifecycle.
//!
//! A step ends in exactly one store transaction that writes the new status,
//! any child jobs and the cascades from [`set_job_status`]. Failures are
//! classified by [`JobError`] and turned into `retrying`, `failed` or
//! `retry_loop_failed` by [`StateMachine::on_failure`].

pub mod execute;
pub mod plan;
pub mod render;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::FileManager;
use crate::error::{DialecticError, Result};
use crate::model::{ModelCaller, ModelCatalog, StubModel};
use crate::progression::set_job_status;
use crate::recipe::RecipeRepository;
use crate::state_machine::{
    ErrorDetails, FailureKind, Job, JobPayload, JobStatus, RetryConfig, StateMachine, Transition,
};
use crate::store::{Store, Tables};

/// How long an idle pool task sleeps before looking for work again.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub retry: RetryConfig,
    pub max_continuations: u32,
    pub model_timeout: Duration,
    pub max_tokens: u32,
    /// A claim older than this whose job is still `processing` belongs to a
    /// worker that went away.
    pub claim_lease: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            max_continuations: 5,
            model_timeout: Duration::from_secs(120),
            max_tokens: 4096,
            claim_lease: Duration::from_secs(600),
        }
    }
}

/// A failed job step, classified for the retry policy.
#[derive(Debug, Clone, Error)]
#[error("{code}: {kind}")]
pub struct JobError {
    pub kind: FailureKind,
    /// Stable code stored in `error_details.code`.
    pub code: &'static str,
}

impl JobError {
    pub fn business(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Business(message.into()),
            code,
        }
    }

    pub fn system(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::System(message.into()),
            code,
        }
    }
}

impl From<DialecticError> for JobError {
    fn from(err: DialecticError) -> Self {
        let code = err.code();
        let message = err.to_string();
        match err {
            DialecticError::Validation(_)
            | DialecticError::NotFound(_)
            | DialecticError::Conflict(_)
            | DialecticError::InvalidTransition { .. }
            | DialecticError::Config(_) => JobError::business(code, message),
            DialecticError::Storage(_) | DialecticError::Io(_) => {
                JobError::system("STORAGE_ERROR", message)
            }
            _ => JobError::system(code, message),
        }
    }
}

/// What a successful step asks the store to record.
#[derive(Debug)]
pub enum Outcome {
    Completed { results: Value, children: Vec<Job> },
    /// Truncated output: requeue the same job with updated continuation state.
    Continue { payload: JobPayload },
    WaitForChildren { children: Vec<Job> },
}

pub struct Worker {
    store: Arc<Store>,
    files: Arc<FileManager>,
    recipes: Arc<dyn RecipeRepository>,
    catalog: Arc<ModelCatalog>,
    model: Arc<dyn ModelCaller>,
    test_model: Arc<dyn ModelCaller>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        store: Arc<Store>,
        files: Arc<FileManager>,
        recipes: Arc<dyn RecipeRepository>,
        catalog: Arc<ModelCatalog>,
        model: Arc<dyn ModelCaller>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            files,
            recipes,
            catalog,
            model,
            test_model: Arc::new(StubModel),
            settings,
        }
    }

    /// Model used for `is_test_job` jobs. Defaults to [`StubModel`].
    pub fn with_test_model(mut self, model: Arc<dyn ModelCaller>) -> Self {
        self.test_model = model;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Claim `job_id` for processing. Returns `None` when the job is not
    /// claimable, so re-delivering a job id is harmless.
    pub fn claim(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.store.transaction(|tx| {
            let now = Utc::now();
            let job = tx.job(job_id)?;
            if job.status == JobStatus::Retrying && job.retry_at.is_none_or(|at| at <= now) {
                set_job_status(tx, job_id, JobStatus::Pending, now)?;
            }
            claim_in(tx, job_id, now)
        })
    }

    /// Promote due retries, then claim the oldest claimable job.
    pub fn claim_next(&self) -> Result<Option<Job>> {
        self.store.transaction(|tx| {
            let now = Utc::now();
            for id in tx.due_retries(now) {
                set_job_status(tx, id, JobStatus::Pending, now)?;
            }
            match tx.next_claimable() {
                Some(id) => claim_in(tx, id, now),
                None => Ok(None),
            }
        })
    }

    /// Run one step of `job_id`. Returns the status the job ended the step
    /// in, or `None` if it was not claimable.
    pub async fn handle_job(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        match self.claim(job_id)? {
            Some(job) => self.process(job).await.map(Some),
            None => {
                debug!(job_id = %job_id, "job not claimable, skipping");
                Ok(None)
            }
        }
    }

    /// Claim and run the next available job, if any.
    pub async fn run_next(&self) -> Result<Option<JobStatus>> {
        match self.claim_next()? {
            Some(job) => self.process(job).await.map(Some),
            None => Ok(None),
        }
    }

    async fn process(&self, job: Job) -> Result<JobStatus> {
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            stage = %job.stage_slug,
            step = job.payload.step_slug().unwrap_or("-"),
            attempt = job.attempt_count,
            "processing job"
        );

        let outcome = match job.payload.validate(job.job_type) {
            Err(msg) => Err(JobError::business("INVALID_PAYLOAD", msg)),
            Ok(()) => match &job.payload {
                JobPayload::Plan(p) => self.run_plan(&job, p),
                JobPayload::Execute(p) => self.run_execute(&job, p).await,
                JobPayload::Render(p) => self.run_render(&job, p).await,
            },
        };

        let written = match outcome {
            Ok(outcome) => self.commit(&job, outcome),
            Err(err) => self.record_failure(&job, err),
        };
        match written {
            Err(DialecticError::InvalidTransition { from, .. }) if from != JobStatus::Processing => {
                warn!(job_id = %job.id, status = %from, "job moved elsewhere while processing, dropping result");
                Ok(from)
            }
            other => other,
        }
    }

    /// Fail every claim older than `lease` as a system error, so the job
    /// retries (or exhausts its attempts) like any other infrastructure
    /// failure. Returns how many jobs were recovered.
    pub fn recover_stale(&self, lease: Duration) -> Result<usize> {
        let Ok(lease) = chrono::Duration::from_std(lease) else {
            return Ok(0);
        };
        let err = JobError::system("WORKER_LOST", "worker stopped before finishing the job");
        self.store.transaction(|tx| {
            let now = Utc::now();
            let Some(cutoff) = now.checked_sub_signed(lease) else {
                return Ok(0);
            };
            let stale: Vec<Job> = tx.stale_claims(cutoff).into_iter().cloned().collect();
            for job in &stale {
                let next = self.write_failure(tx, job, &err, now)?;
                warn!(
                    job_id = %job.id,
                    claimed_at = %job.updated_at,
                    attempt = job.attempt_count,
                    to = %next,
                    "recovered orphaned job"
                );
            }
            Ok(stale.len())
        })
    }

    fn commit(&self, job: &Job, outcome: Outcome) -> Result<JobStatus> {
        self.store.transaction(|tx| {
            let now = Utc::now();
            let next = match outcome {
                Outcome::Completed { results, children } => {
                    insert_children(tx, children)?;
                    tx.job_mut(job.id)?.results = Some(results);
                    JobStatus::Completed
                }
                Outcome::Continue { payload } => {
                    tx.job_mut(job.id)?.payload = payload;
                    JobStatus::PendingContinuation
                }
                Outcome::WaitForChildren { children } => {
                    insert_children(tx, children)?;
                    JobStatus::WaitingForChildren
                }
            };
            set_job_status(tx, job.id, next, now)?;
            Ok(next)
        })
    }

    fn record_failure(&self, job: &Job, err: JobError) -> Result<JobStatus> {
        let now = Utc::now();
        let next = self
            .store
            .transaction(|tx| self.write_failure(tx, job, &err, now))
            .inspect_err(|e| {
                error!(job_id = %job.id, error = %e, "CRITICAL: could not record job failure");
            })?;
        warn!(
            job_id = %job.id,
            code = err.code,
            attempt = job.attempt_count,
            max_retries = job.max_retries,
            to = %next,
            "job step failed: {}",
            err.kind
        );
        Ok(next)
    }

    fn write_failure(
        &self,
        tx: &mut Tables,
        job: &Job,
        err: &JobError,
        now: chrono::DateTime<Utc>,
    ) -> Result<JobStatus> {
        let transition = StateMachine::on_failure(job, err.kind.clone(), &self.settings.retry, now);
        let next = transition.status();
        let row = tx.job_mut(job.id)?;
        row.error_details = Some(ErrorDetails {
            code: err.code.to_string(),
            message: err.kind.message().to_string(),
            retryable: err.kind.is_retryable(),
            attempt: row.attempt_count,
            at: now,
        });
        if let Transition::Retry { retry_at, .. } = &transition {
            row.retry_at = Some(*retry_at);
        }
        set_job_status(tx, job.id, next, now)?;
        Ok(next)
    }
}

fn claim_in(tx: &mut Tables, job_id: Uuid, now: chrono::DateTime<Utc>) -> Result<Option<Job>> {
    if !tx.job(job_id)?.status.is_claimable() {
        return Ok(None);
    }
    set_job_status(tx, job_id, JobStatus::Processing, now)?;
    Ok(Some(tx.job(job_id)?.clone()))
}

fn insert_children(tx: &mut Tables, children: Vec<Job>) -> Result<()> {
    for child in children {
        tx.insert_job(child)?;
    }
    Ok(())
}

/// Totals from one [`WorkerPool::run_until_idle`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub steps: usize,
    pub failed: usize,
}

/// A fixed number of tasks pulling jobs from one [`Worker`].
pub struct WorkerPool {
    worker: Arc<Worker>,
    size: usize,
}

impl WorkerPool {
    pub fn new(worker: Arc<Worker>, size: usize) -> Self {
        Self {
            worker,
            size: size.max(1),
        }
    }

    /// Process jobs until none is queued, backing off or in flight. Claims
    /// that outlive the worker lease are recovered while the pool waits.
    pub async fn run_until_idle(&self) -> Result<PoolReport> {
        let mut tasks = JoinSet::new();
        for index in 0..self.size {
            let worker = self.worker.clone();
            tasks.spawn(async move { drain(worker, index).await });
        }

        let mut report = PoolReport::default();
        while let Some(joined) = tasks.join_next().await {
            let part = joined.map_err(|e| DialecticError::Worker(format!("worker task failed: {e}")))??;
            report.steps += part.steps;
            report.failed += part.failed;
        }
        info!(steps = report.steps, failed = report.failed, "worker pool idle");
        Ok(report)
    }
}

async fn drain(worker: Arc<Worker>, index: usize) -> Result<PoolReport> {
    let mut report = PoolReport::default();
    loop {
        if let Some(status) = worker.run_next().await? {
            report.steps += 1;
            if status.is_failure() {
                report.failed += 1;
            }
            continue;
        }

        let (idle, next_retry) = worker.store.read(|t| (t.is_idle(), t.next_retry_at()))?;
        if idle {
            debug!(worker = index, "no work left");
            return Ok(report);
        }
        if worker.recover_stale(worker.settings.claim_lease)? > 0 {
            continue;
        }
        let wait = next_retry
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .map_or(POLL_INTERVAL, |d| d.min(POLL_INTERVAL));
        sleep(wait).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::artifact::MemoryStorage;
    use crate::model::{FinishReason, ModelCallError, ModelRequest, ModelResponse};
    use crate::planner::{GenerationRequest, JobPlanner};
    use crate::recipe::RecipeBook;
    use crate::session::{Project, Session, SessionStatus};
    use crate::state_machine::JobType;

    /// Replays scripted answers, then falls back to the stub.
    #[derive(Default)]
    pub(crate) struct ScriptedModel {
        pub(crate) script: Mutex<VecDeque<std::result::Result<ModelResponse, ModelCallError>>>,
        pub(crate) requests: Mutex<Vec<ModelRequest>>,
    }

    impl ScriptedModel {
        pub(crate) fn push(&self, answer: std::result::Result<ModelResponse, ModelCallError>) {
            self.script.lock().unwrap().push_back(answer);
        }
    }

    pub(crate) fn answer(content: &str, finish_reason: FinishReason) -> ModelResponse {
        ModelResponse {
            content: content.into(),
            finish_reason,
            input_tokens: 10,
            output_tokens: 20,
            processing_time_ms: 5,
            raw_provider_response: serde_json::json!({"id": "scripted"}),
        }
    }

    #[async_trait]
    impl ModelCaller for ScriptedModel {
        async fn call_model(
            &self,
            request: &ModelRequest,
            auth_token: &str,
        ) -> std::result::Result<ModelResponse, ModelCallError> {
            self.requests.lock().unwrap().push(request.clone());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(answer) => answer,
                None => StubModel.call_model(request, auth_token).await,
            }
        }
    }

    pub(crate) struct Harness {
        pub(crate) worker: Arc<Worker>,
        pub(crate) store: Arc<Store>,
        pub(crate) storage: Arc<MemoryStorage>,
        pub(crate) model: Arc<ScriptedModel>,
        pub(crate) planner: JobPlanner,
        pub(crate) session_id: Uuid,
        pub(crate) project_id: Uuid,
    }

    impl Harness {
        pub(crate) fn new(max_retries: u32) -> Self {
            Self::with_lease(max_retries, WorkerSettings::default().claim_lease)
        }

        pub(crate) fn with_lease(max_retries: u32, claim_lease: Duration) -> Self {
            let store = Arc::new(Store::in_memory());
            let storage = Arc::new(MemoryStorage::new());
            let files = Arc::new(FileManager::new(
                storage.clone(),
                store.clone(),
                "artifacts",
                Duration::from_secs(5),
            ));
            let recipes: Arc<dyn RecipeRepository> = Arc::new(RecipeBook::builtin().unwrap());
            let catalog = Arc::new(ModelCatalog::default());
            let model = Arc::new(ScriptedModel::default());
            let settings = WorkerSettings {
                retry: RetryConfig {
                    max_retries,
                    base_delay_ms: 0,
                },
                claim_lease,
                ..WorkerSettings::default()
            };
            let worker = Arc::new(Worker::new(
                store.clone(),
                files,
                recipes.clone(),
                catalog.clone(),
                model.clone(),
                settings,
            ));

            let project = Project::new("user-1", "demo", "A tool that plans dinner parties");
            let session = Session::new(project.id, vec!["claude-sonnet".into()]);
            let (project_id, session_id) = (project.id, session.id);
            store
                .transaction(|tx| {
                    tx.insert_project(project);
                    tx.insert_session(session);
                    Ok(())
                })
                .unwrap();

            Self {
                planner: JobPlanner::new(store.clone(), recipes, catalog, max_retries),
                worker,
                store,
                storage,
                model,
                session_id,
                project_id,
            }
        }

        pub(crate) fn request(&self, stage: &str) -> GenerationRequest {
            GenerationRequest {
                project_id: self.project_id,
                session_id: self.session_id,
                stage_slug: stage.into(),
                iteration_number: 1,
                selected_model_ids: vec!["claude-sonnet".into()],
                wallet_id: "wallet-1".into(),
                auth_token: "jwt".into(),
                continue_until_complete: Some(true),
                max_retries: None,
                is_test_job: None,
            }
        }

        pub(crate) fn job(&self, id: Uuid) -> Job {
            self.store.read(|t| t.job(id).cloned()).unwrap().unwrap()
        }

        pub(crate) fn session_status(&self) -> SessionStatus {
            self.store
                .read(|t| t.session(self.session_id).map(|s| s.status))
                .unwrap()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn handle_job_is_idempotent_for_finished_jobs() {
        let h = Harness::new(3);
        let root = h.planner.plan(&h.request("thesis")).unwrap().job_ids[0];

        assert_eq!(
            h.worker.handle_job(root).await.unwrap(),
            Some(JobStatus::WaitingForChildren)
        );
        assert_eq!(h.worker.handle_job(root).await.unwrap(), None);
        assert_eq!(h.job(root).attempt_count, 1);
    }

    #[tokio::test]
    async fn system_failures_back_off_then_exhaust() {
        let h = Harness::new(2);
        let root = h.planner.plan(&h.request("thesis")).unwrap().job_ids[0];
        h.worker.handle_job(root).await.unwrap();
        let header = h
            .store
            .read(|t| {
                t.children(root)
                    .into_iter()
                    .find(|j| j.status == JobStatus::Pending)
                    .map(|j| j.id)
            })
            .unwrap()
            .unwrap();

        h.model.push(Err(ModelCallError::retryable("overloaded")));
        h.model.push(Err(ModelCallError::retryable("overloaded")));

        assert_eq!(h.worker.handle_job(header).await.unwrap(), Some(JobStatus::Retrying));
        let job = h.job(header);
        assert_eq!(job.attempt_count, 1);
        assert!(job.retry_at.is_some());
        assert_eq!(job.error_details.as_ref().unwrap().code, "MODEL_ERROR");

        assert_eq!(
            h.worker.handle_job(header).await.unwrap(),
            Some(JobStatus::RetryLoopFailed)
        );
        let job = h.job(header);
        assert_eq!(job.attempt_count, 2);

        // Waiting siblings fail with it, and so does the root.
        let statuses: Vec<JobStatus> = h
            .store
            .read(|t| t.children(root).into_iter().map(|j| j.status).collect())
            .unwrap();
        assert!(statuses.iter().all(|s| s.is_failure()));
        assert_eq!(h.job(root).status, JobStatus::Failed);
        assert_eq!(h.session_status(), SessionStatus::Running(crate::session::Stage::Thesis));
    }

    #[tokio::test]
    async fn rejected_model_call_is_not_retried() {
        let h = Harness::new(3);
        let root = h.planner.plan(&h.request("thesis")).unwrap().job_ids[0];
        h.worker.handle_job(root).await.unwrap();
        h.model.push(Err(ModelCallError::fatal("invalid request")));

        let status = h.worker.run_next().await.unwrap();
        assert_eq!(status, Some(JobStatus::Failed));
        let failed = h
            .store
            .read(|t| {
                t.children(root)
                    .into_iter()
                    .find(|j| j.attempt_count == 1)
                    .cloned()
            })
            .unwrap()
            .unwrap();
        let details = failed.error_details.unwrap();
        assert_eq!(details.code, "MODEL_REJECTED");
        assert!(!details.retryable);
    }

    #[tokio::test]
    async fn invalid_payload_fails_without_retry() {
        let h = Harness::new(3);
        let root = h.planner.plan(&h.request("thesis")).unwrap().job_ids[0];
        h.store
            .transaction(|tx| {
                let job = tx.job_mut(root)?;
                job.job_type = JobType::Execute;
                Ok(())
            })
            .unwrap();

        assert_eq!(h.worker.handle_job(root).await.unwrap(), Some(JobStatus::Failed));
        assert_eq!(h.job(root).error_details.unwrap().code, "INVALID_PAYLOAD");
    }

    #[tokio::test]
    async fn pool_runs_a_stage_to_completion() {
        let h = Harness::new(3);
        h.planner.plan(&h.request("thesis")).unwrap();

        let report = WorkerPool::new(h.worker.clone(), 3).run_until_idle().await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(h.session_status(), SessionStatus::Pending(crate::session::Stage::Antithesis));
        assert!(h.store.read(|t| t.is_idle()).unwrap());
    }

    #[tokio::test]
    async fn abandoned_claim_is_retried_as_system_failure() {
        let h = Harness::new(3);
        let root = h.planner.plan(&h.request("thesis")).unwrap().job_ids[0];
        let claimed = h.worker.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, root);

        // A fresh claim is inside its lease.
        assert_eq!(h.worker.recover_stale(Duration::from_secs(600)).unwrap(), 0);
        assert_eq!(h.job(root).status, JobStatus::Processing);

        assert_eq!(h.worker.recover_stale(Duration::ZERO).unwrap(), 1);
        let job = h.job(root);
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.attempt_count, 1);
        let details = job.error_details.unwrap();
        assert_eq!(details.code, "WORKER_LOST");
        assert!(details.retryable);

        assert_eq!(h.worker.recover_stale(Duration::ZERO).unwrap(), 0);
        assert_eq!(
            h.worker.handle_job(root).await.unwrap(),
            Some(JobStatus::WaitingForChildren)
        );
        assert_eq!(h.job(root).attempt_count, 2);
    }

    #[tokio::test]
    async fn abandoned_claim_on_last_attempt_exhausts() {
        let h = Harness::new(1);
        let root = h.planner.plan(&h.request("thesis")).unwrap().job_ids[0];
        h.worker.claim_next().unwrap().unwrap();

        assert_eq!(h.worker.recover_stale(Duration::ZERO).unwrap(), 1);
        assert_eq!(h.job(root).status, JobStatus::RetryLoopFailed);
        assert!(h.store.read(|t| t.is_idle()).unwrap());
    }

    #[tokio::test]
    async fn pool_recovers_claims_left_by_a_lost_worker() {
        let h = Harness::with_lease(3, Duration::ZERO);
        let root = h.planner.plan(&h.request("thesis")).unwrap().job_ids[0];
        h.worker.claim_next().unwrap().unwrap();

        let pool = WorkerPool::new(h.worker.clone(), 1);
        let report = tokio::time::timeout(Duration::from_secs(10), pool.run_until_idle())
            .await
            .expect("pool stalled on an abandoned claim")
            .unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(h.job(root).status, JobStatus::Completed);
        assert_eq!(h.job(root).attempt_count, 2);
        assert_eq!(h.session_status(), SessionStatus::Pending(crate::session::Stage::Antithesis));
    }
}
