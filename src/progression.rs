//! Job status writes and everything they cascade into.
//!
//! [`set_job_status`] is the only way a job's status changes. It runs inside
//! a store transaction, so the follow-on writes it triggers commit together
//! with the job row:
//!
//! - a root PLAN entering `processing` moves its session from
//!   `pending_<stage>` to `running_<stage>`
//! - a terminal job releases (or fails) jobs waiting on it as a prerequisite
//! - a terminal descendant re-evaluates its root PLAN once all siblings are done
//! - a terminal root PLAN advances the session, but only when every root PLAN
//!   of the stage pass completed
//!
//! The lifecycle edges (first claim of a root, retry, stored output, stage
//! complete, root failed) also queue a [`Notification`] for the project owner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::ResourceRecord;
use crate::error::{DialecticError, Result};
use crate::model::ModelCatalog;
use crate::notify::{Event, Notification};
use crate::session::{Session, SessionStatus, Stage};
use crate::state_machine::{ErrorDetails, Job, JobPayload, JobStatus, JobSummary, StateMachine};
use crate::store::{Store, Tables};

/// Move `job_id` to `next` and apply the cascades.
pub fn set_job_status(
    tx: &mut Tables,
    job_id: Uuid,
    next: JobStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    let job = tx.job_mut(job_id)?;
    let from = job.status;
    StateMachine::transition(job, next, now)?;
    debug!(job_id = %job_id, job_type = %job.job_type, %from, to = %next, "job status");

    let job = job.clone();
    if next == JobStatus::Processing && job.is_root_plan() {
        if from == JobStatus::Pending && job.attempt_count == 1 {
            let event = Event::ContributionGenerationStarted {
                job_id: job.id,
                model_id: job.payload.pass().model_id.clone(),
            };
            notify(tx, &job, event);
        }
        start_stage(tx, &job, now);
    }
    announce(tx, &job, next);
    if next.is_terminal() {
        release_dependents(tx, &job, now)?;
        if !job.is_root() {
            evaluate_root(tx, job.root_job_id, now)?;
        }
        if job.is_root_plan() {
            evaluate_stage(tx, &job, now);
        }
    }
    Ok(())
}

/// Queue the notification for a status edge that has one.
fn announce(tx: &mut Tables, job: &Job, next: JobStatus) {
    let event = match (&job.payload, next) {
        (_, JobStatus::Retrying) => Event::ContributionGenerationRetrying {
            job_id: job.id,
            attempt: job.attempt_count,
            max_retries: job.max_retries,
            retry_at: job.retry_at,
        },
        (JobPayload::Execute(p), JobStatus::Completed | JobStatus::PendingContinuation) => {
            Event::DialecticContributionReceived {
                job_id: job.id,
                model_id: p.pass.model_id.clone(),
                document_key: p.document_key.clone(),
                is_continuing: next == JobStatus::PendingContinuation,
            }
        }
        (JobPayload::Plan(p), status) if status.is_failure() && job.is_root() => {
            Event::ContributionGenerationFailed {
                job_id: job.id,
                model_id: p.pass.model_id.clone(),
                code: job.error_details.as_ref().map(|e| e.code.clone()),
                message: job.error_details.as_ref().map(|e| e.message.clone()),
            }
        }
        _ => return,
    };
    notify(tx, job, event);
}

fn notify(tx: &mut Tables, job: &Job, event: Event) {
    notify_session(tx, job.session_id, job.stage_slug, event);
}

fn notify_session(tx: &mut Tables, session_id: Uuid, stage: Stage, event: Event) {
    let owner = tx
        .session(session_id)
        .and_then(|s| tx.project(s.project_id))
        .map(|p| p.owner_user_id.clone());
    match owner {
        Ok(target_user_id) => tx.notify(Notification {
            target_user_id,
            session_id,
            stage,
            event,
        }),
        Err(e) => debug!(%session_id, kind = event.kind(), error = %e, "no recipient for notification"),
    }
}

fn start_stage(tx: &mut Tables, root: &Job, now: DateTime<Utc>) {
    let Some(session) = tx.sessions.get_mut(&root.session_id) else {
        error!(
            job_id = %root.id,
            session_id = %root.session_id,
            "CRITICAL: root job started but its session does not exist"
        );
        return;
    };

    match session.status {
        SessionStatus::Pending(stage) if stage == root.stage_slug => {
            session.status = SessionStatus::Running(stage);
            session.updated_at = now;
            info!(session_id = %session.id, status = %session.status, "stage started");
        }
        SessionStatus::Running(stage) if stage == root.stage_slug => {}
        other => warn!(
            session_id = %session.id,
            status = %other,
            stage = %root.stage_slug,
            "root job started while session is in another stage"
        ),
    }
}

fn release_dependents(tx: &mut Tables, job: &Job, now: DateTime<Utc>) -> Result<()> {
    for dependent in tx.waiting_on(job.id) {
        if job.status == JobStatus::Completed {
            set_job_status(tx, dependent, JobStatus::Pending, now)?;
        } else {
            let waiting = tx.job_mut(dependent)?;
            waiting.error_details = Some(ErrorDetails {
                code: "PREREQUISITE_FAILED".into(),
                message: format!("prerequisite job {} ended as {}", job.id, job.status),
                retryable: false,
                attempt: waiting.attempt_count,
                at: now,
            });
            set_job_status(tx, dependent, JobStatus::Failed, now)?;
        }
    }
    Ok(())
}

/// Once every descendant of a waiting root is terminal, fail the root if any
/// of them failed, otherwise hand it back to a worker for the next step.
fn evaluate_root(tx: &mut Tables, root_id: Uuid, now: DateTime<Utc>) -> Result<()> {
    let root = tx.job(root_id)?;
    if root.status != JobStatus::WaitingForChildren {
        return Ok(());
    }

    let descendants = tx.descendants(root_id);
    if descendants.iter().any(|j| !j.status.is_terminal()) {
        return Ok(());
    }
    let failed = descendants.iter().filter(|j| j.status.is_failure()).count();

    if failed > 0 {
        let root = tx.job_mut(root_id)?;
        root.error_details = Some(ErrorDetails {
            code: "CHILD_FAILED".into(),
            message: format!("{failed} descendant job(s) failed"),
            retryable: false,
            attempt: root.attempt_count,
            at: now,
        });
        set_job_status(tx, root_id, JobStatus::Failed, now)
    } else {
        set_job_status(tx, root_id, JobStatus::PendingNextStep, now)
    }
}

fn evaluate_stage(tx: &mut Tables, root: &Job, now: DateTime<Utc>) {
    let stage = root.stage_slug;
    let roots = tx.root_plan_jobs(root.session_id, stage, root.iteration_number);
    if roots.iter().any(|r| !r.status.is_terminal()) {
        debug!(session_id = %root.session_id, %stage, "waiting for other root jobs");
        return;
    }
    let unfinished: Vec<String> = roots
        .iter()
        .filter(|r| r.status != JobStatus::Completed)
        .map(|r| format!("{}={}", r.id, r.status))
        .collect();
    if !unfinished.is_empty() {
        warn!(
            session_id = %root.session_id,
            %stage,
            roots = %unfinished.join(","),
            "stage ended with failed root jobs, session stays running"
        );
        return;
    }

    let Some(session) = tx.sessions.get_mut(&root.session_id) else {
        error!(
            job_id = %root.id,
            session_id = %root.session_id,
            "CRITICAL: stage completed but its session does not exist"
        );
        return;
    };
    if session.status != SessionStatus::Running(stage)
        || session.iteration_count != root.iteration_number
    {
        error!(
            session_id = %session.id,
            status = %session.status,
            %stage,
            iteration = root.iteration_number,
            "CRITICAL: stage completed but session cannot advance from its current status"
        );
        return;
    }

    match stage.next() {
        Some(next) => {
            session.status = SessionStatus::Pending(next);
            session.current_stage = next;
        }
        None => session.status = SessionStatus::IterationCompletePendingReview,
    }
    session.updated_at = now;
    let status = session.status;
    info!(session_id = %root.session_id, %status, "session advanced");
    notify_session(
        tx,
        root.session_id,
        stage,
        Event::ContributionGenerationComplete { status },
    );
}

/// Operator action: end a live job as `failed`. Cascades exactly like a
/// natural failure.
pub fn force_fail(store: &Store, job_id: Uuid, reason: &str) -> Result<Job> {
    store.transaction(|tx| {
        let now = Utc::now();
        let job = tx.job_mut(job_id)?;
        if job.status.is_terminal() {
            return Err(DialecticError::Conflict(format!(
                "job {job_id} is already {}",
                job.status
            )));
        }
        job.error_details = Some(ErrorDetails {
            code: "FORCED_FAILURE".into(),
            message: reason.to_string(),
            retryable: false,
            attempt: job.attempt_count,
            at: now,
        });
        set_job_status(tx, job_id, JobStatus::Failed, now)?;
        warn!(job_id = %job_id, reason, "job force-failed by operator");
        Ok(tx.job(job_id)?.clone())
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelContributions {
    pub model_id: String,
    pub display_name: String,
    pub contributions: Vec<ResourceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetails {
    pub session: Session,
    pub project_name: String,
    pub models: Vec<ModelContributions>,
    pub jobs: Vec<JobSummary>,
}

/// Session status, current stage and per-model contributions.
pub fn session_details(
    store: &Store,
    catalog: &ModelCatalog,
    session_id: Uuid,
) -> Result<SessionDetails> {
    store.read(|t| {
        let session = t.session(session_id)?.clone();
        let project_name = t
            .project(session.project_id)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        let resources = t.session_resources(session_id);

        let models = session
            .selected_model_ids
            .iter()
            .map(|model_id| ModelContributions {
                model_id: model_id.clone(),
                display_name: catalog
                    .get(model_id)
                    .map(|m| m.display_name.clone())
                    .unwrap_or_else(|| model_id.clone()),
                contributions: resources
                    .iter()
                    .filter(|r| &r.model_id == model_id)
                    .map(|r| (*r).clone())
                    .collect(),
            })
            .collect();

        let jobs = t
            .session_jobs(session_id)
            .into_iter()
            .map(JobSummary::from_job)
            .collect();

        Ok(SessionDetails {
            session,
            project_name,
            models,
            jobs,
        })
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Project, Stage};
    use crate::state_machine::payload::tests::{execute_payload, plan_payload};

    struct Fixture {
        tables: Tables,
        session_id: Uuid,
    }

    impl Fixture {
        fn new(stage: Stage) -> Self {
            let mut tables = Tables::default();
            let project = Project::new("user-1", "demo", "prompt");
            let mut session = Session::new(project.id, vec!["claude-sonnet".into()]);
            session.status = SessionStatus::Pending(stage);
            session.current_stage = stage;
            let session_id = session.id;
            tables.insert_project(project);
            tables.insert_session(session);
            Self { tables, session_id }
        }

        fn root(&mut self, stage: Stage) -> Uuid {
            let job = Job::root(self.session_id, stage, 1, plan_payload(), 3, false);
            let id = job.id;
            self.tables.insert_job(job).unwrap();
            id
        }

        fn child(&mut self, parent: Uuid) -> Uuid {
            let parent = self.tables.job(parent).unwrap().clone();
            let job = Job::child(&parent, execute_payload("business_case"));
            let id = job.id;
            self.tables.insert_job(job).unwrap();
            id
        }

        fn set(&mut self, id: Uuid, status: JobStatus) {
            set_job_status(&mut self.tables, id, status, Utc::now()).unwrap();
        }

        fn status(&self, id: Uuid) -> JobStatus {
            self.tables.job(id).unwrap().status
        }

        fn session_status(&self) -> SessionStatus {
            self.tables.session(self.session_id).unwrap().status
        }

        /// Drive a root through expansion with one child that ends as `child_status`.
        fn run_root(&mut self, root: Uuid, child_status: JobStatus) -> Uuid {
            self.set(root, JobStatus::Processing);
            let child = self.child(root);
            self.set(root, JobStatus::WaitingForChildren);
            self.set(child, JobStatus::Processing);
            self.set(child, child_status);
            child
        }
    }

    #[test]
    fn processing_root_starts_the_stage() {
        let mut f = Fixture::new(Stage::Thesis);
        let root = f.root(Stage::Thesis);
        f.set(root, JobStatus::Processing);
        assert_eq!(f.session_status(), SessionStatus::Running(Stage::Thesis));

        let second = f.root(Stage::Thesis);
        f.set(second, JobStatus::Processing);
        assert_eq!(f.session_status(), SessionStatus::Running(Stage::Thesis));
    }

    #[test]
    fn children_done_hands_root_back_for_next_step() {
        let mut f = Fixture::new(Stage::Thesis);
        let root = f.root(Stage::Thesis);
        f.run_root(root, JobStatus::Completed);
        assert_eq!(f.status(root), JobStatus::PendingNextStep);
        assert_eq!(f.session_status(), SessionStatus::Running(Stage::Thesis));

        f.set(root, JobStatus::Processing);
        f.set(root, JobStatus::Completed);
        assert_eq!(f.session_status(), SessionStatus::Pending(Stage::Antithesis));
        let session = f.tables.session(f.session_id).unwrap();
        assert_eq!(session.current_stage, Stage::Antithesis);
    }

    #[test]
    fn failed_child_fails_root_and_blocks_stage() {
        let mut f = Fixture::new(Stage::Thesis);
        let root = f.root(Stage::Thesis);
        f.run_root(root, JobStatus::RetryLoopFailed);
        assert_eq!(f.status(root), JobStatus::Failed);
        assert_eq!(
            f.tables.job(root).unwrap().error_details.as_ref().unwrap().code,
            "CHILD_FAILED"
        );
        assert_eq!(f.session_status(), SessionStatus::Running(Stage::Thesis));
    }

    #[test]
    fn root_waits_while_any_descendant_is_live() {
        let mut f = Fixture::new(Stage::Thesis);
        let root = f.root(Stage::Thesis);
        f.set(root, JobStatus::Processing);
        let a = f.child(root);
        let b = f.child(root);
        f.set(root, JobStatus::WaitingForChildren);

        f.set(a, JobStatus::Processing);
        f.set(a, JobStatus::Completed);
        assert_eq!(f.status(root), JobStatus::WaitingForChildren);

        f.set(b, JobStatus::Processing);
        f.set(b, JobStatus::Retrying);
        assert_eq!(f.status(root), JobStatus::WaitingForChildren);
    }

    #[test]
    fn stage_with_two_roots_waits_for_both() {
        let mut f = Fixture::new(Stage::Synthesis);
        let first = f.root(Stage::Synthesis);
        let second = f.root(Stage::Synthesis);

        f.set(first, JobStatus::Processing);
        f.set(first, JobStatus::Completed);
        assert_eq!(f.session_status(), SessionStatus::Running(Stage::Synthesis));

        f.set(second, JobStatus::Processing);
        f.set(second, JobStatus::Completed);
        assert_eq!(f.session_status(), SessionStatus::Pending(Stage::Parenthesis));
    }

    #[test]
    fn last_stage_ends_iteration() {
        let mut f = Fixture::new(Stage::Paralysis);
        let root = f.root(Stage::Paralysis);
        f.set(root, JobStatus::Processing);
        f.set(root, JobStatus::Completed);
        assert_eq!(f.session_status(), SessionStatus::IterationCompletePendingReview);
        assert_eq!(f.tables.session(f.session_id).unwrap().iteration_count, 1);
    }

    #[test]
    fn prerequisite_success_releases_dependent() {
        let mut f = Fixture::new(Stage::Thesis);
        let root = f.root(Stage::Thesis);
        f.set(root, JobStatus::Processing);
        let producer = f.child(root);
        let parent = f.tables.job(root).unwrap().clone();
        let waiting = Job::child(&parent, execute_payload("feature_spec")).waiting_on(producer);
        let waiting_id = waiting.id;
        f.tables.insert_job(waiting).unwrap();
        f.set(root, JobStatus::WaitingForChildren);

        f.set(producer, JobStatus::Processing);
        f.set(producer, JobStatus::Completed);
        assert_eq!(f.status(waiting_id), JobStatus::Pending);
        assert_eq!(f.status(root), JobStatus::WaitingForChildren);
    }

    #[test]
    fn prerequisite_failure_fails_dependent_and_root() {
        let mut f = Fixture::new(Stage::Thesis);
        let root = f.root(Stage::Thesis);
        f.set(root, JobStatus::Processing);
        let producer = f.child(root);
        let parent = f.tables.job(root).unwrap().clone();
        let waiting = Job::child(&parent, execute_payload("feature_spec")).waiting_on(producer);
        let waiting_id = waiting.id;
        f.tables.insert_job(waiting).unwrap();
        f.set(root, JobStatus::WaitingForChildren);

        f.set(producer, JobStatus::Processing);
        f.set(producer, JobStatus::Failed);
        assert_eq!(f.status(waiting_id), JobStatus::Failed);
        assert_eq!(
            f.tables.job(waiting_id).unwrap().error_details.as_ref().unwrap().code,
            "PREREQUISITE_FAILED"
        );
        assert_eq!(f.status(root), JobStatus::Failed);
    }

    #[test]
    fn missing_session_does_not_block_job_write() {
        let mut f = Fixture::new(Stage::Thesis);
        let root = f.root(Stage::Thesis);
        f.set(root, JobStatus::Processing);
        f.tables.sessions.clear();

        f.set(root, JobStatus::Completed);
        assert_eq!(f.status(root), JobStatus::Completed);
    }

    #[test]
    fn terminal_root_is_never_reopened() {
        let mut f = Fixture::new(Stage::Thesis);
        let root = f.root(Stage::Thesis);
        f.set(root, JobStatus::Processing);
        f.set(root, JobStatus::Failed);

        let err = set_job_status(&mut f.tables, root, JobStatus::Completed, Utc::now()).unwrap_err();
        assert!(matches!(err, DialecticError::InvalidTransition { .. }));
        assert_eq!(f.session_status(), SessionStatus::Running(Stage::Thesis));
    }

    #[test]
    fn force_fail_behaves_like_natural_failure() {
        let f = Fixture::new(Stage::Thesis);
        let store = Store::in_memory();
        let session_id = f.session_id;
        let root = Job::root(session_id, Stage::Thesis, 1, plan_payload(), 3, false);
        let root_id = root.id;
        store
            .transaction(|tx| {
                *tx = f.tables.clone();
                tx.insert_job(root)?;
                set_job_status(tx, root_id, JobStatus::Processing, Utc::now())?;
                set_job_status(tx, root_id, JobStatus::WaitingForChildren, Utc::now())?;
                set_job_status(tx, root_id, JobStatus::PendingNextStep, Utc::now())
            })
            .unwrap();

        let job = force_fail(&store, root_id, "operator").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_details.unwrap().code, "FORCED_FAILURE");

        let status = store.read(|t| t.session(session_id).map(|s| s.status)).unwrap().unwrap();
        assert_eq!(status, SessionStatus::Running(Stage::Thesis));

        let err = force_fail(&store, root_id, "again").unwrap_err();
        assert!(matches!(err, DialecticError::Conflict(_)));
    }

    #[test]
    fn lifecycle_edges_queue_owner_notifications() {
        let mut f = Fixture::new(Stage::Thesis);
        let root = f.root(Stage::Thesis);
        f.set(root, JobStatus::Processing);
        let child = f.child(root);
        f.set(root, JobStatus::WaitingForChildren);

        f.set(child, JobStatus::Processing);
        f.tables.job_mut(child).unwrap().retry_at = Some(Utc::now());
        f.set(child, JobStatus::Retrying);
        f.set(child, JobStatus::Pending);
        f.set(child, JobStatus::Processing);
        f.set(child, JobStatus::Completed);
        f.set(root, JobStatus::Processing);
        f.set(root, JobStatus::Completed);

        let kinds: Vec<&str> = f.tables.outbox.iter().map(|n| n.event.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "contribution_generation_started",
                "contribution_generation_retrying",
                "dialectic_contribution_received",
                "contribution_generation_complete",
            ]
        );
        assert!(f
            .tables
            .outbox
            .iter()
            .all(|n| n.target_user_id == "user-1" && n.session_id == f.session_id));
        assert_eq!(
            f.tables.outbox[3].event,
            Event::ContributionGenerationComplete {
                status: SessionStatus::Pending(Stage::Antithesis)
            }
        );
    }

    #[test]
    fn failed_root_is_announced_with_its_error() {
        let mut f = Fixture::new(Stage::Thesis);
        let root = f.root(Stage::Thesis);
        f.run_root(root, JobStatus::RetryLoopFailed);

        let last = f.tables.outbox.last().unwrap();
        match &last.event {
            Event::ContributionGenerationFailed { job_id, code, .. } => {
                assert_eq!(*job_id, root);
                assert_eq!(code.as_deref(), Some("CHILD_FAILED"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn details_group_contributions_by_model() {
        let f = Fixture::new(Stage::Thesis);
        let store = Store::in_memory();
        let session_id = f.session_id;
        store
            .transaction(|tx| {
                *tx = f.tables.clone();
                Ok(())
            })
            .unwrap();

        let details = session_details(&store, &ModelCatalog::default(), session_id).unwrap();
        assert_eq!(details.project_name, "demo");
        assert_eq!(details.models.len(), 1);
        assert_eq!(details.models[0].display_name, "Claude Sonnet");
        assert!(details.jobs.is_empty());

        let err = session_details(&store, &ModelCatalog::default(), Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DialecticError::NotFound(_)));
    }
}
