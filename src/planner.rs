//! Turns a generation request into root PLAN jobs, and a PLAN job into waves
//! of EXECUTE jobs.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::artifact::path::sanitize_for_path;
use crate::artifact::{SourceScope, select_sources};
use crate::error::{DialecticError, Result};
use crate::model::ModelCatalog;
use crate::recipe::{Recipe, RecipeRepository, RecipeStep};
use crate::session::{SessionStatus, Stage};
use crate::state_machine::{
    ExecutePayload, Job, JobPayload, JobType, PassContext, PlanPayload,
};
use crate::store::{Store, Tables};

/// Caller request to start generation for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub project_id: Uuid,
    pub session_id: Uuid,
    pub stage_slug: String,
    pub iteration_number: u32,
    pub selected_model_ids: Vec<String>,
    pub wallet_id: String,
    pub auth_token: String,
    #[serde(default)]
    pub continue_until_complete: Option<bool>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub is_test_job: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub job_ids: Vec<Uuid>,
}

/// What a PLAN job should do next.
#[derive(Debug)]
pub enum Expansion {
    /// New EXECUTE jobs for this wave.
    Spawn(Vec<Job>),
    /// Every recipe step has been expanded.
    Finished,
    /// Steps remain but none can ever start. Lists the missing inputs.
    Blocked(Vec<String>),
}

pub struct JobPlanner {
    store: Arc<Store>,
    recipes: Arc<dyn RecipeRepository>,
    catalog: Arc<ModelCatalog>,
    default_max_retries: u32,
}

impl JobPlanner {
    pub fn new(
        store: Arc<Store>,
        recipes: Arc<dyn RecipeRepository>,
        catalog: Arc<ModelCatalog>,
        default_max_retries: u32,
    ) -> Self {
        Self {
            store,
            recipes,
            catalog,
            default_max_retries,
        }
    }

    /// Validate the request and create one root PLAN job per selected model.
    /// Either every root job is created or none is.
    pub fn plan(&self, req: &GenerationRequest) -> Result<GenerationResponse> {
        if req.wallet_id.trim().is_empty() {
            return Err(DialecticError::Validation("walletId is required".into()));
        }
        if req.auth_token.trim().is_empty() {
            return Err(DialecticError::Validation("authToken is required".into()));
        }
        if req.selected_model_ids.is_empty() {
            return Err(DialecticError::Validation(
                "selectedModelIds must not be empty".into(),
            ));
        }
        if req.iteration_number == 0 {
            return Err(DialecticError::Validation(
                "iterationNumber starts at 1".into(),
            ));
        }
        let mut unique = HashSet::new();
        if let Some(dup) = req.selected_model_ids.iter().find(|m| !unique.insert(m.as_str())) {
            return Err(DialecticError::Validation(format!(
                "model '{dup}' selected twice"
            )));
        }

        let stage: Stage = req
            .stage_slug
            .parse()
            .map_err(|e: String| DialecticError::NotFound(e))?;
        let recipe = self
            .recipes
            .recipe_for(stage)
            .ok_or_else(|| DialecticError::NotFound(format!("recipe for stage '{stage}'")))?;
        if recipe.steps.is_empty() {
            return Err(DialecticError::NotFound(format!(
                "recipe for stage '{stage}' has no steps"
            )));
        }
        for model_id in &req.selected_model_ids {
            if self.catalog.get(model_id).is_none() {
                return Err(DialecticError::NotFound(format!("model '{model_id}'")));
            }
        }

        let max_retries = req.max_retries.unwrap_or(self.default_max_retries);
        if max_retries == 0 {
            return Err(DialecticError::Validation(
                "maxRetries must be at least 1".into(),
            ));
        }
        let job_ids = self.store.transaction(|tx| {
            let project = tx.project(req.project_id)?;
            if project.owner_user_id.trim().is_empty() {
                return Err(DialecticError::NotFound(format!(
                    "owner of project {}",
                    project.id
                )));
            }
            let user_id = project.owner_user_id.clone();

            let session = tx.session(req.session_id)?;
            if session.project_id != req.project_id {
                return Err(DialecticError::Validation(format!(
                    "session {} does not belong to project {}",
                    session.id, req.project_id
                )));
            }
            if session.iteration_count != req.iteration_number {
                return Err(DialecticError::Validation(format!(
                    "session is on iteration {}, not {}",
                    session.iteration_count, req.iteration_number
                )));
            }
            if session.current_stage != stage {
                return Err(DialecticError::Validation(format!(
                    "session is on stage '{}', not '{stage}'",
                    session.current_stage
                )));
            }
            if session.status != SessionStatus::Pending(stage) {
                return Err(DialecticError::Validation(format!(
                    "session status is '{}', expected 'pending_{stage}'",
                    session.status
                )));
            }
            if !tx
                .root_plan_jobs(req.session_id, stage, req.iteration_number)
                .is_empty()
            {
                return Err(DialecticError::Conflict(format!(
                    "stage '{stage}' of iteration {} is already planned",
                    req.iteration_number
                )));
            }

            let mut ids = Vec::with_capacity(req.selected_model_ids.len());
            for model_id in &req.selected_model_ids {
                let payload = JobPayload::Plan(PlanPayload {
                    pass: PassContext {
                        project_id: req.project_id,
                        model_id: model_id.clone(),
                        wallet_id: req.wallet_id.clone(),
                        auth_token: req.auth_token.clone(),
                        continue_until_complete: req.continue_until_complete.unwrap_or(false),
                        source_group: Uuid::new_v4(),
                    },
                    user_id: user_id.clone(),
                });
                let job = Job::root(
                    req.session_id,
                    stage,
                    req.iteration_number,
                    payload,
                    max_retries,
                    req.is_test_job.unwrap_or(false),
                );
                ids.push(job.id);
                tx.insert_job(job)?;
            }
            Ok(ids)
        })?;

        info!(
            session_id = %req.session_id,
            %stage,
            iteration = req.iteration_number,
            roots = job_ids.len(),
            "planned stage"
        );
        Ok(GenerationResponse { job_ids })
    }
}

/// Work out the next wave of EXECUTE jobs for `plan`.
///
/// - steps whose required inputs all exist start as `pending`
/// - steps missing only inputs that one step of this wave writes directly
///   wait on that step's job
/// - everything else waits for a later wave
pub fn expand_plan(tables: &Tables, plan: &Job, payload: &PlanPayload, recipe: &Recipe) -> Expansion {
    let expanded: HashSet<&str> = tables
        .children(plan.id)
        .into_iter()
        .filter(|j| j.job_type == JobType::Execute)
        .filter_map(|j| j.payload.step_slug())
        .collect();
    let remaining: Vec<&RecipeStep> = recipe
        .steps
        .iter()
        .filter(|s| !expanded.contains(s.step_slug.as_str()))
        .collect();
    if remaining.is_empty() {
        return Expansion::Finished;
    }

    let scope = SourceScope::for_job(plan);
    let mut wave: Vec<(&str, Job)> = Vec::new();
    let mut missing_report = Vec::new();

    for step in &remaining {
        let selection = select_sources(tables, &scope, &step.inputs_required);
        if selection.is_satisfied() {
            let anchor = anchor_model(step, &selection, &payload.pass.model_id);
            wave.push((step.step_slug.as_str(), execute_job(plan, payload, step, anchor)));
        }
    }

    loop {
        let mut changed = false;
        for step in &remaining {
            if wave.iter().any(|(slug, _)| *slug == step.step_slug) {
                continue;
            }
            let selection = select_sources(tables, &scope, &step.inputs_required);
            let producers: Option<HashSet<&str>> = selection
                .missing
                .iter()
                .map(|rule| {
                    recipe
                        .producer_of(rule)
                        .filter(|p| p.outputs_required.execute_output() == Some(rule.kind.resource_type()))
                        .map(|p| p.step_slug.as_str())
                        .filter(|slug| wave.iter().any(|(s, _)| s == slug))
                })
                .collect();
            let Some(producers) = producers.filter(|p| p.len() == 1) else {
                continue;
            };
            let Some(producer_job) = producers
                .iter()
                .next()
                .and_then(|slug| wave.iter().find(|(s, _)| s == slug))
                .map(|(_, job)| job.id)
            else {
                continue;
            };
            let anchor = anchor_model(step, &selection, &payload.pass.model_id);
            let job = execute_job(plan, payload, step, anchor).waiting_on(producer_job);
            wave.push((step.step_slug.as_str(), job));
            changed = true;
        }
        if !changed {
            break;
        }
    }

    if wave.is_empty() {
        for step in &remaining {
            let selection = select_sources(tables, &scope, &step.inputs_required);
            for rule in selection.missing {
                missing_report.push(format!("{}<-{}:{}", step.step_slug, rule.slug, rule.document_key));
            }
        }
        return Expansion::Blocked(missing_report);
    }

    Expansion::Spawn(wave.into_iter().map(|(_, job)| job).collect())
}

fn execute_job(plan: &Job, payload: &PlanPayload, step: &RecipeStep, anchor: Option<String>) -> Job {
    Job::child(
        plan,
        JobPayload::Execute(ExecutePayload {
            pass: payload.pass.clone(),
            step_slug: step.step_slug.clone(),
            document_key: step.outputs_required.document_key.clone(),
            source_anchor_model_slug: anchor,
            continuation: None,
        }),
    )
}

/// Model slug of the document this step critiques, preferring another model's work.
fn anchor_model(
    step: &RecipeStep,
    selection: &crate::artifact::SourceSelection,
    own_model: &str,
) -> Option<String> {
    let rule = step.inputs_required.iter().find(|r| r.anchor)?;
    let candidates: Vec<_> = selection.matching(rule).collect();
    candidates
        .iter()
        .find(|r| r.model_id != own_model)
        .or_else(|| candidates.first())
        .map(|r| sanitize_for_path(&r.model_id))
}
