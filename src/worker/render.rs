use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use super::execute::{RawChunk, strip_code_fence};
use super::{JobError, Outcome, Worker};
use crate::artifact::{FileType, PathContext, ResourceRecord, UploadContext};
use crate::recipe::OutputRule;
use crate::state_machine::{Job, RenderPayload};

impl Worker {
    /// Chunk texts of one contribution in turn order.
    pub(crate) async fn load_chunks(&self, root_contribution_id: Uuid) -> Result<Vec<String>, JobError> {
        let records = self.chunk_records(root_contribution_id)?;
        let mut texts = Vec::with_capacity(records.len());
        for record in &records {
            let bytes = self.files.download(record).await?;
            let chunk: RawChunk = serde_json::from_slice(&bytes).map_err(|e| {
                JobError::system(
                    "CORRUPT_CHUNK",
                    format!("{} is not a response chunk: {e}", record.object_key()),
                )
            })?;
            texts.push(chunk.content);
        }
        Ok(texts)
    }

    fn chunk_records(&self, root_contribution_id: Uuid) -> Result<Vec<ResourceRecord>, JobError> {
        Ok(self.store.read(|t| {
            t.contribution_chunks(root_contribution_id)
                .into_iter()
                .cloned()
                .collect()
        })?)
    }

    /// Stitch every chunk of the contribution into the final markdown document.
    pub(crate) async fn run_render(
        &self,
        job: &Job,
        payload: &RenderPayload,
    ) -> Result<Outcome, JobError> {
        let step = self.recipe_step(job, &payload.step_slug)?;
        let records = self.chunk_records(payload.root_contribution_id)?;
        let Some(first) = records.first() else {
            return Err(JobError::business(
                "MISSING_INPUTS",
                format!("contribution {} has no chunks", payload.root_contribution_id),
            ));
        };
        let relationships = first.document_relationships.clone();

        let body = self.load_chunks(payload.root_contribution_id).await?.concat();
        let markdown = render_markdown(&step.outputs_required, &body);

        let path = PathContext {
            project_id: payload.pass.project_id,
            session_id: job.session_id,
            iteration: job.iteration_number,
            stage: job.stage_slug,
            file_type: FileType::RenderedDocument,
            model_slug: payload.pass.model_id.clone(),
            attempt: job.attempt_count.saturating_sub(1),
            document_key: payload.document_key.clone(),
            source_group: Some(payload.pass.source_group),
            source_anchor_model_slug: payload.source_anchor_model_slug.clone(),
            turn_index: 0,
        };
        let mut upload = UploadContext::new(path, job.id, &payload.pass.model_id, markdown.into_bytes());
        upload.relationships = relationships;
        let record = self.files.upload_and_register(upload).await?;

        info!(
            job_id = %job.id,
            document = %payload.document_key,
            chunks = records.len(),
            path = %record.object_key(),
            "rendered document"
        );
        Ok(Outcome::Completed {
            results: json!({
                "resource_id": record.id,
                "file_name": record.file_name,
                "chunks": records.len(),
            }),
            children: Vec::new(),
        })
    }
}

/// Markdown for one document. A JSON object body becomes one section per
/// field listed in `context_for_documents` (every field when none are
/// listed); anything else is used as written.
pub fn render_markdown(output: &OutputRule, body: &str) -> String {
    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(strip_code_fence(body)) else {
        return body.to_string();
    };

    let mut out = format!("# {}\n", title_case(&output.document_key));
    let keys: Vec<&str> = match output.sections_for(&output.document_key) {
        Some(sections) => sections.iter().map(String::as_str).collect(),
        None => fields.keys().map(String::as_str).collect(),
    };
    for key in keys {
        let Some(value) = fields.get(key) else {
            continue;
        };
        out.push_str(&format!("\n## {}\n\n", title_case(key)));
        match value {
            Value::String(text) => out.push_str(text.trim_end()),
            Value::Array(items) => {
                let lines: Vec<String> = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => format!("- {s}"),
                        other => format!("- {other}"),
                    })
                    .collect();
                out.push_str(&lines.join("\n"));
            }
            other => out.push_str(&format!(
                "```json\n{}\n```",
                serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())
            )),
        }
        out.push('\n');
    }
    out
}

fn title_case(key: &str) -> String {
    key.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
