use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::job::{FailureKind, Job, RetryConfig};
use crate::error::{DialecticError, Result};

/// Lifecycle status of a job row.
///
/// `completed`, `failed` and `retry_loop_failed` are terminal. Every other
/// status eventually leads back to `processing` or to a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    RetryLoopFailed,
    PendingContinuation,
    PendingNextStep,
    WaitingForChildren,
    WaitingForPrerequisite,
}

impl JobStatus {
    pub const ALL: [JobStatus; 10] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retrying,
        JobStatus::RetryLoopFailed,
        JobStatus::PendingContinuation,
        JobStatus::PendingNextStep,
        JobStatus::WaitingForChildren,
        JobStatus::WaitingForPrerequisite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::RetryLoopFailed => "retry_loop_failed",
            JobStatus::PendingContinuation => "pending_continuation",
            JobStatus::PendingNextStep => "pending_next_step",
            JobStatus::WaitingForChildren => "waiting_for_children",
            JobStatus::WaitingForPrerequisite => "waiting_for_prerequisite",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::RetryLoopFailed
        )
    }

    /// Terminal and not successful.
    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::RetryLoopFailed)
    }

    /// Statuses a worker may claim.
    pub fn is_claimable(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::PendingContinuation | JobStatus::PendingNextStep
        )
    }

    /// Statuses that still have queued or in-flight work behind them.
    pub fn is_active(&self) -> bool {
        self.is_claimable() || matches!(self, JobStatus::Processing | JobStatus::Retrying)
    }

    /// Whether a job may move from `self` to `next`.
    ///
    /// Any non-terminal job may be forced into `failed`. Terminal jobs never move.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        match self {
            Pending | PendingContinuation | PendingNextStep => next == Processing,
            Retrying => next == Pending,
            Processing => matches!(
                next,
                Completed
                    | Retrying
                    | RetryLoopFailed
                    | PendingContinuation
                    | PendingNextStep
                    | WaitingForChildren
            ),
            WaitingForChildren => matches!(next, PendingNextStep | Completed),
            WaitingForPrerequisite => next == Pending,
            Completed | Failed | RetryLoopFailed => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of evaluating a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Re-queue the job once `retry_at` has passed.
    Retry {
        retry_at: DateTime<Utc>,
        reason: FailureKind,
    },
    /// The job ends in a terminal failure status.
    Fail {
        status: JobStatus,
        reason: FailureKind,
    },
}

impl Transition {
    pub fn status(&self) -> JobStatus {
        match self {
            Transition::Retry { .. } => JobStatus::Retrying,
            Transition::Fail { status, .. } => *status,
        }
    }
}

/// Applies status changes to a `Job` row.
pub struct StateMachine;

impl StateMachine {
    /// Move `job` to `next`, enforcing the transition table.
    ///
    /// Claiming a fresh or retried job (`pending → processing`) consumes one
    /// attempt. Continuations and next-step claims do not.
    pub fn transition(job: &mut Job, next: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !job.status.can_transition_to(next) {
            return Err(DialecticError::InvalidTransition {
                job_id: job.id,
                from: job.status,
                to: next,
            });
        }

        if job.status == JobStatus::Pending && next == JobStatus::Processing {
            job.attempt_count += 1;
        }
        if next == JobStatus::Processing && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if next != JobStatus::Retrying {
            job.retry_at = None;
        }
        if next.is_terminal() {
            job.completed_at = Some(now);
        }

        job.status = next;
        job.updated_at = now;
        Ok(())
    }

    /// Decide what a failed attempt turns into.
    ///
    /// - `Business` failures are not retried.
    /// - `System` failures retry with exponential backoff until
    ///   `attempt_count >= max_retries`, then end in `retry_loop_failed`.
    pub fn on_failure(
        job: &Job,
        reason: FailureKind,
        retry: &RetryConfig,
        now: DateTime<Utc>,
    ) -> Transition {
        if !reason.is_retryable() {
            return Transition::Fail {
                status: JobStatus::Failed,
                reason,
            };
        }
        if job.attempt_count >= job.max_retries {
            return Transition::Fail {
                status: JobStatus::RetryLoopFailed,
                reason,
            };
        }
        let delay_ms = retry.delay_for_attempt(job.attempt_count);
        Transition::Retry {
            retry_at: now + Duration::milliseconds(delay_ms as i64),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Stage;
    use crate::state_machine::job::JobType;
    use crate::state_machine::payload::tests::plan_payload;
    use uuid::Uuid;

    fn make_job(max_retries: u32) -> Job {
        Job::root(
            Uuid::new_v4(),
            Stage::Thesis,
            1,
            plan_payload(),
            max_retries,
            false,
        )
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }

    #[test]
    fn claim_from_pending_consumes_an_attempt() {
        let mut job = make_job(3);
        let now = Utc::now();
        StateMachine::transition(&mut job, JobStatus::Processing, now).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.started_at, Some(now));
    }

    #[test]
    fn continuation_claim_keeps_attempt_count() {
        let mut job = make_job(3);
        let now = Utc::now();
        StateMachine::transition(&mut job, JobStatus::Processing, now).unwrap();
        StateMachine::transition(&mut job, JobStatus::PendingContinuation, now).unwrap();
        StateMachine::transition(&mut job, JobStatus::Processing, now).unwrap();
        assert_eq!(job.attempt_count, 1);

        StateMachine::transition(&mut job, JobStatus::WaitingForChildren, now).unwrap();
        StateMachine::transition(&mut job, JobStatus::PendingNextStep, now).unwrap();
        StateMachine::transition(&mut job, JobStatus::Processing, now).unwrap();
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn terminal_jobs_never_move() {
        let mut job = make_job(3);
        let now = Utc::now();
        StateMachine::transition(&mut job, JobStatus::Processing, now).unwrap();
        StateMachine::transition(&mut job, JobStatus::Completed, now).unwrap();
        assert_eq!(job.completed_at, Some(now));

        for next in JobStatus::ALL {
            let err = StateMachine::transition(&mut job, next, now).unwrap_err();
            assert!(matches!(err, DialecticError::InvalidTransition { .. }));
        }
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn any_live_status_can_be_forced_to_failed() {
        for from in JobStatus::ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(JobStatus::Failed), "{from}");
        }
    }

    #[test]
    fn pending_cannot_skip_processing() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Retrying.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::WaitingForPrerequisite.can_transition_to(JobStatus::Processing));
    }

    #[test]
    fn business_failure_fails_immediately() {
        let mut job = make_job(3);
        StateMachine::transition(&mut job, JobStatus::Processing, Utc::now()).unwrap();
        let t = StateMachine::on_failure(
            &job,
            FailureKind::Business("wallet missing".into()),
            &retry(),
            Utc::now(),
        );
        assert_eq!(t.status(), JobStatus::Failed);
    }

    #[test]
    fn system_failure_retries_with_backoff_until_exhausted() {
        let mut job = make_job(3);
        let now = Utc::now();

        for attempt in 1..=2u32 {
            StateMachine::transition(&mut job, JobStatus::Processing, now).unwrap();
            assert_eq!(job.attempt_count, attempt);
            let t = StateMachine::on_failure(
                &job,
                FailureKind::System("timeout".into()),
                &retry(),
                now,
            );
            match &t {
                Transition::Retry { retry_at, .. } => {
                    let expected = retry().delay_for_attempt(attempt) as i64;
                    assert_eq!((*retry_at - now).num_milliseconds(), expected);
                }
                other => panic!("expected retry, got {other:?}"),
            }
            StateMachine::transition(&mut job, t.status(), now).unwrap();
            StateMachine::transition(&mut job, JobStatus::Pending, now).unwrap();
        }

        StateMachine::transition(&mut job, JobStatus::Processing, now).unwrap();
        assert_eq!(job.attempt_count, 3);
        let t = StateMachine::on_failure(&job, FailureKind::System("timeout".into()), &retry(), now);
        assert_eq!(t.status(), JobStatus::RetryLoopFailed);
    }

    #[test]
    fn zero_retries_exhausts_on_first_failure() {
        let mut job = make_job(0);
        StateMachine::transition(&mut job, JobStatus::Processing, Utc::now()).unwrap();
        let t = StateMachine::on_failure(
            &job,
            FailureKind::System("boom".into()),
            &retry(),
            Utc::now(),
        );
        assert_eq!(t.status(), JobStatus::RetryLoopFailed);
    }

    #[test]
    fn status_display_and_serde_agree() {
        for status in JobStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
        assert_eq!(JobStatus::RetryLoopFailed.to_string(), "retry_loop_failed");
        assert_eq!(make_job(1).job_type, JobType::Plan);
    }
}
