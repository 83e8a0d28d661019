use serde_json::json;
use tracing::info;

use super::{JobError, Outcome, Worker};
use crate::planner::{Expansion, expand_plan};
use crate::state_machine::{Job, JobStatus, PlanPayload};

impl Worker {
    /// Expand the next wave of the stage recipe, or finish the PLAN when
    /// every step has run.
    pub(crate) fn run_plan(&self, job: &Job, payload: &PlanPayload) -> Result<Outcome, JobError> {
        let recipe = self.recipes.recipe_for(job.stage_slug).ok_or_else(|| {
            JobError::business(
                "STAGE_CONFIG_MISSING",
                format!("no recipe for stage '{}'", job.stage_slug),
            )
        })?;

        let expansion = self
            .store
            .read(|t| expand_plan(t, job, payload, recipe))
            .map_err(JobError::from)?;

        match expansion {
            Expansion::Spawn(children) => {
                let waiting = children
                    .iter()
                    .filter(|c| c.status == JobStatus::WaitingForPrerequisite)
                    .count();
                info!(
                    job_id = %job.id,
                    stage = %job.stage_slug,
                    model = %payload.pass.model_id,
                    spawned = children.len(),
                    waiting,
                    "expanded plan wave"
                );
                Ok(Outcome::WaitForChildren { children })
            }
            Expansion::Finished => Ok(Outcome::Completed {
                results: json!({ "steps": recipe.steps.len() }),
                children: Vec::new(),
            }),
            Expansion::Blocked(missing) => Err(JobError::business(
                "MISSING_INPUTS",
                format!("no recipe step can start, missing {}", missing.join(", ")),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::session::{SessionStatus, Stage};
    use crate::state_machine::{JobStatus, JobType};
    use crate::worker::WorkerPool;
    use crate::worker::tests::Harness;

    #[tokio::test]
    async fn plan_without_prior_stage_fails_on_missing_inputs() {
        let h = Harness::new(3);
        h.store
            .transaction(|tx| {
                let session = tx
                    .sessions
                    .get_mut(&h.session_id)
                    .ok_or_else(|| crate::error::DialecticError::NotFound("session".into()))?;
                session.status = SessionStatus::Pending(Stage::Antithesis);
                session.current_stage = Stage::Antithesis;
                Ok(())
            })
            .unwrap();
        let root = h.planner.plan(&h.request("antithesis")).unwrap().job_ids[0];

        assert_eq!(h.worker.handle_job(root).await.unwrap(), Some(JobStatus::Failed));
        let details = h.job(root).error_details.unwrap();
        assert_eq!(details.code, "MISSING_INPUTS");
        assert!(!details.retryable);
        assert_eq!(h.session_status(), SessionStatus::Running(Stage::Antithesis));
    }

    #[tokio::test]
    async fn rendered_same_stage_input_runs_in_a_later_wave() {
        let h = Harness::new(3);
        let pool = WorkerPool::new(h.worker.clone(), 2);
        for stage in ["thesis", "antithesis"] {
            h.planner.plan(&h.request(stage)).unwrap();
            pool.run_until_idle().await.unwrap();
        }
        let root = h.planner.plan(&h.request("synthesis")).unwrap().job_ids[0];

        h.worker.handle_job(root).await.unwrap();
        let first_wave = steps_of(&h, root);
        assert_eq!(first_wave, vec!["header_context", "synthesis_document"]);

        pool.run_until_idle().await.unwrap();
        let all = steps_of(&h, root);
        assert_eq!(all, vec!["header_context", "synthesis_document", "synthesis_summary"]);

        let plan = h.job(root);
        assert_eq!(plan.status, JobStatus::Completed);
        assert_eq!(plan.attempt_count, 1);
        assert_eq!(h.session_status(), SessionStatus::Pending(Stage::Parenthesis));
    }

    fn steps_of(h: &Harness, root: uuid::Uuid) -> Vec<String> {
        let mut steps: Vec<String> = h
            .store
            .read(|t| {
                t.children(root)
                    .into_iter()
                    .filter(|j| j.job_type == JobType::Execute)
                    .filter_map(|j| j.payload.step_slug().map(str::to_string))
                    .collect()
            })
            .unwrap();
        steps.sort();
        steps
    }
}
