use std::collections::HashSet;

use uuid::Uuid;

use super::manager::FileManager;
use super::{DocumentRelationships, ResourceRecord};
use crate::error::{DialecticError, Result};
use crate::recipe::{ANY_STAGE, InputRule};
use crate::session::Stage;
use crate::state_machine::Job;
use crate::store::{Store, Tables};

/// Where a job looks for its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceScope {
    pub session_id: Uuid,
    pub iteration: u32,
    pub stage: Stage,
    /// Same-stage inputs only come from this lineage.
    pub source_group: Uuid,
}

impl SourceScope {
    pub fn for_job(job: &Job) -> Self {
        Self {
            session_id: job.session_id,
            iteration: job.iteration_number,
            stage: job.stage_slug,
            source_group: job.payload.pass().source_group,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceSelection {
    pub records: Vec<ResourceRecord>,
    /// Required rules nothing matched.
    pub missing: Vec<InputRule>,
}

impl SourceSelection {
    pub fn is_satisfied(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn matching(&self, rule: &InputRule) -> impl Iterator<Item = &ResourceRecord> {
        self.records
            .iter()
            .filter(move |r| rule_matches(rule, r, None))
    }
}

#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub record: ResourceRecord,
    pub content: String,
}

impl SourceDocument {
    pub fn document_relationships(&self) -> &DocumentRelationships {
        &self.record.document_relationships
    }
}

fn rule_matches(rule: &InputRule, record: &ResourceRecord, scope: Option<&SourceScope>) -> bool {
    if record.resource_type != rule.kind.resource_type() || record.document_key != rule.document_key {
        return false;
    }
    if rule.slug != ANY_STAGE && record.stage_slug.slug() != rule.slug {
        return false;
    }
    match scope {
        Some(scope) => {
            record.session_id == scope.session_id
                && record.iteration_number == scope.iteration
                && (rule.stage() != Some(scope.stage)
                    || record.source_group() == Some(scope.source_group))
        }
        None => true,
    }
}

/// Pick the resources that satisfy `inputs`, newest first per rule, one per file name.
pub fn select_sources(tables: &Tables, scope: &SourceScope, inputs: &[InputRule]) -> SourceSelection {
    let mut selection = SourceSelection::default();
    let mut seen_ids = HashSet::new();

    for rule in inputs {
        let mut matches: Vec<&ResourceRecord> = tables
            .resources
            .values()
            .filter(|r| rule_matches(rule, r, Some(scope)))
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let mut seen_names = HashSet::new();
        let mut found = false;
        for record in matches {
            if !seen_names.insert(record.file_name.as_str()) {
                continue;
            }
            found = true;
            if seen_ids.insert(record.id) {
                selection.records.push(record.clone());
            }
        }

        if !found && rule.required {
            selection.missing.push(rule.clone());
        }
    }

    selection
}

/// Resolve and download the inputs of `job`. Records come back exactly as
/// registered, relationships included.
pub async fn find_source_documents(
    store: &Store,
    files: &FileManager,
    job: &Job,
    inputs: &[InputRule],
) -> Result<Vec<SourceDocument>> {
    let scope = SourceScope::for_job(job);
    let selection = store.read(|t| select_sources(t, &scope, inputs))?;

    if !selection.is_satisfied() {
        let missing: Vec<String> = selection
            .missing
            .iter()
            .map(|r| format!("{}:{}", r.slug, r.document_key))
            .collect();
        return Err(DialecticError::NotFound(format!(
            "required inputs missing: {}",
            missing.join(", ")
        )));
    }

    let mut documents = Vec::with_capacity(selection.records.len());
    for record in selection.records {
        let content = files.download_text(&record).await?;
        documents.push(SourceDocument { record, content });
    }
    Ok(documents)
}
