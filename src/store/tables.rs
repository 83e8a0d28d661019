use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::{ResourceRecord, ResourceType};
use crate::error::{DialecticError, Result};
use crate::notify::Notification;
use crate::session::{Project, Session, Stage};
use crate::state_machine::{Job, JobStatus, JobType};

/// Every persisted row. A transaction works on a copy of this.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    #[serde(default)]
    pub projects: BTreeMap<Uuid, Project>,
    #[serde(default)]
    pub sessions: BTreeMap<Uuid, Session>,
    #[serde(default)]
    pub jobs: BTreeMap<Uuid, Job>,
    #[serde(default)]
    pub resources: BTreeMap<Uuid, ResourceRecord>,
    /// Notifications queued by this transaction, delivered after commit.
    #[serde(skip)]
    pub(crate) outbox: Vec<Notification>,
}

impl Tables {
    pub fn job(&self, id: Uuid) -> Result<&Job> {
        self.jobs
            .get(&id)
            .ok_or_else(|| DialecticError::NotFound(format!("job {id}")))
    }

    pub fn job_mut(&mut self, id: Uuid) -> Result<&mut Job> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| DialecticError::NotFound(format!("job {id}")))
    }

    pub fn session(&self, id: Uuid) -> Result<&Session> {
        self.sessions
            .get(&id)
            .ok_or_else(|| DialecticError::NotFound(format!("session {id}")))
    }

    pub fn project(&self, id: Uuid) -> Result<&Project> {
        self.projects
            .get(&id)
            .ok_or_else(|| DialecticError::NotFound(format!("project {id}")))
    }

    pub fn insert_project(&mut self, project: Project) {
        self.projects.insert(project.id, project);
    }

    pub fn insert_session(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    pub fn insert_job(&mut self, job: Job) -> Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(DialecticError::Conflict(format!("job {} already exists", job.id)));
        }
        self.jobs.insert(job.id, job);
        Ok(())
    }

    pub fn insert_resource(&mut self, record: ResourceRecord) -> Result<()> {
        if self.resources.contains_key(&record.id) {
            return Err(DialecticError::Conflict(format!(
                "resource {} already exists",
                record.id
            )));
        }
        self.resources.insert(record.id, record);
        Ok(())
    }

    /// Root PLAN jobs of one stage pass. Fixed once planning commits.
    pub fn root_plan_jobs(&self, session_id: Uuid, stage: Stage, iteration: u32) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|j| {
                j.is_root_plan()
                    && j.session_id == session_id
                    && j.stage_slug == stage
                    && j.iteration_number == iteration
            })
            .collect()
    }

    /// Every job below `root_id`, at any depth.
    pub fn descendants(&self, root_id: Uuid) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|j| j.root_job_id == root_id && j.id != root_id)
            .collect()
    }

    pub fn children(&self, parent_id: Uuid) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|j| j.parent_job_id == Some(parent_id))
            .collect()
    }

    /// Jobs parked on `prerequisite_id`.
    pub fn waiting_on(&self, prerequisite_id: Uuid) -> Vec<Uuid> {
        self.jobs
            .values()
            .filter(|j| {
                j.prerequisite_job_id == Some(prerequisite_id)
                    && j.status == JobStatus::WaitingForPrerequisite
            })
            .map(|j| j.id)
            .collect()
    }

    pub fn session_jobs(&self, session_id: Uuid) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| j.session_id == session_id)
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Oldest claimable job, PLAN jobs first so stages fan out early.
    pub fn next_claimable(&self) -> Option<Uuid> {
        self.jobs
            .values()
            .filter(|j| j.status.is_claimable())
            .min_by_key(|j| (j.job_type != JobType::Plan, j.created_at, j.id))
            .map(|j| j.id)
    }

    /// Retrying jobs whose backoff has elapsed.
    pub fn due_retries(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Retrying && j.retry_at.is_none_or(|at| at <= now))
            .map(|j| j.id)
            .collect()
    }

    /// Earliest pending retry time, if any job is backing off.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Retrying)
            .filter_map(|j| j.retry_at)
            .min()
    }

    /// Jobs claimed at or before `cutoff` and still `processing`.
    pub fn stale_claims(&self, cutoff: DateTime<Utc>) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing && j.updated_at <= cutoff)
            .collect()
    }

    pub fn notify(&mut self, notification: Notification) {
        self.outbox.push(notification);
    }

    /// True when no job has queued or in-flight work.
    pub fn is_idle(&self) -> bool {
        !self.jobs.values().any(|j| j.status.is_active())
    }

    /// Every chunk of a contribution, one per turn, in turn order. When a turn
    /// was written more than once the newest chunk wins.
    pub fn contribution_chunks(&self, root_contribution_id: Uuid) -> Vec<&ResourceRecord> {
        let mut by_turn: BTreeMap<u32, &ResourceRecord> = BTreeMap::new();
        for record in self.resources.values().filter(|r| {
            r.resource_type == ResourceType::ModelContributionRaw
                && r.contribution_root() == root_contribution_id
        }) {
            match by_turn.get(&record.turn_index) {
                Some(existing) if existing.created_at > record.created_at => {}
                _ => {
                    by_turn.insert(record.turn_index, record);
                }
            }
        }
        by_turn.into_values().collect()
    }

    pub fn session_resources(&self, session_id: Uuid) -> Vec<&ResourceRecord> {
        let mut records: Vec<&ResourceRecord> = self
            .resources
            .values()
            .filter(|r| r.session_id == session_id)
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }
}
