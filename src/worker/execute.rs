use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{JobError, Outcome, Worker};
use crate::artifact::{
    ContributionMetrics, DocumentRelationships, FileType, PathContext, SourceDocument,
    UploadContext, find_source_documents,
};
use crate::error::DialecticError;
use crate::model::{ChatMessage, FinishReason, ModelRequest, ModelResponse};
use crate::recipe::{OutputFormat, RecipeStep};
use crate::state_machine::{Continuation, ExecutePayload, Job, JobPayload, RenderPayload};

const CONTINUE_PROMPT: &str =
    "Continue exactly where your previous message stopped. Do not repeat anything already written.";

/// What a raw response file holds: the chunk text plus the provider's answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChunk {
    pub content: String,
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub provider_response: Value,
}

impl Worker {
    /// Call the model for one recipe step and persist what it returns.
    pub(crate) async fn run_execute(
        &self,
        job: &Job,
        payload: &ExecutePayload,
    ) -> Result<Outcome, JobError> {
        let pass = &payload.pass;
        if pass.wallet_id.trim().is_empty() {
            return Err(JobError::business("WALLET_MISSING", "job has no wallet"));
        }
        if pass.auth_token.trim().is_empty() {
            return Err(JobError::business("AUTH_MISSING", "job has no auth token"));
        }
        let step = self.recipe_step(job, &payload.step_slug)?;
        let model = self.catalog.get(&pass.model_id).ok_or_else(|| {
            JobError::business("MODEL_NOT_FOUND", format!("unknown model '{}'", pass.model_id))
        })?;
        let brief = self
            .store
            .read(|t| {
                t.project(pass.project_id)
                    .map(|p| format!("Project: {}\n\n{}", p.name, p.initial_user_prompt))
            })
            .map_err(JobError::from)?
            .map_err(|e| JobError::business("PROJECT_NOT_FOUND", e.to_string()))?;

        let sources = find_source_documents(&self.store, &self.files, job, &step.inputs_required)
            .await
            .map_err(|e| match e {
                DialecticError::NotFound(msg) => JobError::business("MISSING_INPUTS", msg),
                other => JobError::from(other),
            })?;

        let prompt = build_prompt(step, job, &sources);
        let mut messages = vec![ChatMessage::user(prompt)];
        if let Some(continuation) = payload.continuation {
            let earlier = self.load_chunks(continuation.root_contribution_id).await?;
            messages.push(ChatMessage::assistant(earlier.concat()));
            messages.push(ChatMessage::user(CONTINUE_PROMPT));
        }

        let request = ModelRequest {
            model_id: model.id.clone(),
            api_identifier: model.api_identifier.clone(),
            max_tokens: self.settings.max_tokens,
            system: Some(brief),
            messages,
            response_format: step.outputs_required.file_type,
        };
        let response = self.call_model(job, &request, &pass.auth_token).await?;

        // Raw chunk first, so a later failure never loses paid-for output.
        let turn = payload.continuation.map_or(0, |c| c.count);
        let path = self.path_context(job, payload, FileType::ModelContributionRaw, turn);
        let envelope = RawChunk {
            content: response.content.clone(),
            finish_reason: response.finish_reason,
            provider_response: response.raw_provider_response.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| JobError::system("SERIALIZE_FAILED", e.to_string()))?;
        let mut upload = UploadContext::new(path, job.id, &pass.model_id, bytes);
        let root_contribution_id = payload
            .continuation
            .map_or(upload.resource_id, |c| c.root_contribution_id);
        upload.relationships = lineage(job, &sources, root_contribution_id);
        upload.target_contribution_id = payload.continuation.map(|c| c.root_contribution_id);
        upload.metrics = Some(ContributionMetrics {
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            processing_time_ms: response.processing_time_ms,
        });
        let chunk = self.files.upload_and_register(upload).await?;
        debug!(job_id = %job.id, resource_id = %chunk.id, turn, "stored response chunk");

        if response.finish_reason.needs_continuation() {
            if pass.continue_until_complete && turn < self.settings.max_continuations {
                let mut next = payload.clone();
                next.continuation = Some(Continuation {
                    count: turn + 1,
                    root_contribution_id,
                });
                info!(
                    job_id = %job.id,
                    step = %payload.step_slug,
                    continuation = turn + 1,
                    "response truncated, continuing"
                );
                return Ok(Outcome::Continue {
                    payload: JobPayload::Execute(next),
                });
            }
            warn!(
                job_id = %job.id,
                step = %payload.step_slug,
                continuations = turn,
                "response truncated, keeping partial output"
            );
        }

        self.finish_execute(job, payload, step, &sources, root_contribution_id, turn + 1)
            .await
    }

    async fn call_model(
        &self,
        job: &Job,
        request: &ModelRequest,
        auth_token: &str,
    ) -> Result<ModelResponse, JobError> {
        let caller = if job.is_test_job {
            &self.test_model
        } else {
            &self.model
        };
        match timeout(
            self.settings.model_timeout,
            caller.call_model(request, auth_token),
        )
        .await
        {
            Err(_) => Err(JobError::system(
                "MODEL_TIMEOUT",
                format!(
                    "model '{}' did not answer within {}s",
                    request.model_id,
                    self.settings.model_timeout.as_secs()
                ),
            )),
            Ok(Err(e)) if e.retryable => Err(JobError::system("MODEL_ERROR", e.message)),
            Ok(Err(e)) => Err(JobError::business("MODEL_REJECTED", e.message)),
            Ok(Ok(response)) => Ok(response),
        }
    }

    /// Persist the step's own JSON artifact and queue the RENDER child.
    async fn finish_execute(
        &self,
        job: &Job,
        payload: &ExecutePayload,
        step: &RecipeStep,
        sources: &[SourceDocument],
        root_contribution_id: Uuid,
        chunks: u32,
    ) -> Result<Outcome, JobError> {
        let output = &step.outputs_required;
        let mut results = json!({
            "document_key": output.document_key,
            "root_contribution_id": root_contribution_id,
            "chunks": chunks,
        });

        if let Some(resource_type) = output.execute_output() {
            let text = self.load_chunks(root_contribution_id).await?.concat();
            let value: Value = serde_json::from_str(strip_code_fence(&text)).map_err(|e| {
                JobError::system(
                    "INVALID_JSON_RESPONSE",
                    format!("{} is not valid JSON: {e}", output.document_key),
                )
            })?;
            let bytes = serde_json::to_vec_pretty(&value)
                .map_err(|e| JobError::system("SERIALIZE_FAILED", e.to_string()))?;
            let path = self.path_context(job, payload, resource_type.file_type(), 0);
            let mut upload = UploadContext::new(path, job.id, &payload.pass.model_id, bytes);
            upload.relationships = lineage(job, sources, root_contribution_id);
            let record = self.files.upload_and_register(upload).await?;
            results["artifact_id"] = json!(record.id);
        }

        let mut children = Vec::new();
        let decision = output.should_render();
        debug!(job_id = %job.id, should_render = decision.should_render, reason = ?decision.reason, "render decision");
        if decision.should_render {
            children.push(Job::child(
                job,
                JobPayload::Render(RenderPayload {
                    pass: payload.pass.clone(),
                    step_slug: payload.step_slug.clone(),
                    document_key: payload.document_key.clone(),
                    root_contribution_id,
                    source_anchor_model_slug: payload.source_anchor_model_slug.clone(),
                }),
            ));
        }

        Ok(Outcome::Completed { results, children })
    }

    pub(crate) fn recipe_step(&self, job: &Job, step_slug: &str) -> Result<&RecipeStep, JobError> {
        self.recipes
            .recipe_for(job.stage_slug)
            .and_then(|r| r.step(step_slug))
            .ok_or_else(|| {
                JobError::business(
                    "STAGE_CONFIG_MISSING",
                    format!("stage '{}' has no step '{step_slug}'", job.stage_slug),
                )
            })
    }

    fn path_context(
        &self,
        job: &Job,
        payload: &ExecutePayload,
        file_type: FileType,
        turn_index: u32,
    ) -> PathContext {
        PathContext {
            project_id: payload.pass.project_id,
            session_id: job.session_id,
            iteration: job.iteration_number,
            stage: job.stage_slug,
            file_type,
            model_slug: payload.pass.model_id.clone(),
            attempt: job.attempt_count.saturating_sub(1),
            document_key: payload.document_key.clone(),
            source_group: Some(payload.pass.source_group),
            source_anchor_model_slug: payload.source_anchor_model_slug.clone(),
            turn_index,
        }
    }
}

fn build_prompt(step: &RecipeStep, job: &Job, sources: &[SourceDocument]) -> String {
    let mut prompt = format!(
        "{}\n\nStage: {}\nDocument: {}\n",
        step.instructions, job.stage_slug, step.outputs_required.document_key
    );
    let output = &step.outputs_required;
    if let Some(sections) = output.sections_for(&output.document_key) {
        prompt.push_str(&format!("Sections: {}\n", sections.join(", ")));
    }
    for doc in sources {
        prompt.push_str(&format!(
            "\n--- {} ({} stage, {}) ---\n{}\n",
            doc.record.document_key, doc.record.stage_slug, doc.record.model_id, doc.content
        ));
    }
    if step.outputs_required.file_type == OutputFormat::Json {
        prompt.push_str("\nAnswer with a single JSON object and nothing else.\n");
    }
    prompt
}

/// Stage links for a new artifact: everything the sources were linked to,
/// plus this stage's contribution.
fn lineage(job: &Job, sources: &[SourceDocument], root_contribution_id: Uuid) -> DocumentRelationships {
    let mut relationships = DocumentRelationships::default();
    for doc in sources {
        for (stage, id) in &doc.document_relationships().stages {
            relationships.stages.entry(stage.clone()).or_insert(*id);
        }
    }
    relationships
        .stages
        .insert(job.stage_slug.slug().to_string(), root_contribution_id);
    relationships
}

/// Models like to wrap JSON in a markdown code fence.
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.split_once('\n').map_or("", |(_, rest)| rest);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
