//! Deterministic storage paths for generated artifacts.
//!
//! Layout: `{project}/session_{short}/iteration_{n}/{idx}_{stage}/{dir}/{file}`.
//!
//! File names embed the producing model, the attempt, the document key and,
//! when the artifact belongs to a source group, an 8-character fragment of it:
//!
//! - simple: `{model}_{attempt}_{document_key}[_{fragment}]{suffix}`
//! - critique: `{model}_critiquing_{anchor}[_{fragment}]_{attempt}_{document_key}{suffix}`
//!
//! Header context files drop the document key since the suffix already names it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::{Stage, short_id};

const HEADER_SUFFIX: &str = "_header_context.json";
const ASSEMBLED_SUFFIX: &str = "_assembled.json";
const RAW_SUFFIX: &str = "_raw.json";
const CONTINUATION_MARKER: &str = "_continuation_";
const RENDERED_SUFFIX: &str = ".md";
const CRITIQUE_MARKER: &str = "_critiquing_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    ModelContributionRaw,
    HeaderContext,
    AssembledDocumentJson,
    RenderedDocument,
}

impl FileType {
    pub fn directory(&self) -> &'static str {
        match self {
            FileType::ModelContributionRaw => "raw_responses",
            FileType::HeaderContext => "_work/context",
            FileType::AssembledDocumentJson => "_work/assembled_json",
            FileType::RenderedDocument => "documents",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            FileType::RenderedDocument => "text/markdown",
            _ => "application/json",
        }
    }
}

/// Everything a storage path is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathContext {
    pub project_id: Uuid,
    pub session_id: Uuid,
    pub iteration: u32,
    pub stage: Stage,
    pub file_type: FileType,
    pub model_slug: String,
    pub attempt: u32,
    pub document_key: String,
    pub source_group: Option<Uuid>,
    pub source_anchor_model_slug: Option<String>,
    /// Continuation chunk index; only raw files carry it.
    pub turn_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePath {
    pub storage_path: String,
    pub file_name: String,
}

impl StoragePath {
    pub fn full(&self) -> String {
        format!("{}/{}", self.storage_path, self.file_name)
    }
}

/// Lowercase and replace anything outside `[a-z0-9.-]` with `-`.
///
/// Underscores separate file name fields, so slugs must not contain them.
pub fn sanitize_for_path(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

pub fn source_group_fragment(source_group: &Uuid) -> String {
    short_id(&source_group.to_string())
}

pub fn construct_storage_path(ctx: &PathContext) -> StoragePath {
    let storage_path = format!(
        "{}/session_{}/iteration_{}/{}_{}/{}",
        ctx.project_id,
        short_id(&ctx.session_id.to_string()),
        ctx.iteration,
        ctx.stage.index(),
        ctx.stage.slug(),
        ctx.file_type.directory(),
    );

    let model = sanitize_for_path(&ctx.model_slug);
    let fragment = ctx.source_group.as_ref().map(source_group_fragment);
    let document_key = match ctx.file_type {
        FileType::HeaderContext => None,
        _ => Some(ctx.document_key.as_str()),
    };

    let mut stem = match &ctx.source_anchor_model_slug {
        Some(anchor) => {
            let mut s = format!("{model}{CRITIQUE_MARKER}{}", sanitize_for_path(anchor));
            if let Some(fragment) = &fragment {
                s.push('_');
                s.push_str(fragment);
            }
            s.push_str(&format!("_{}", ctx.attempt));
            if let Some(key) = document_key {
                s.push('_');
                s.push_str(key);
            }
            s
        }
        None => {
            let mut s = format!("{model}_{}", ctx.attempt);
            if let Some(key) = document_key {
                s.push('_');
                s.push_str(key);
            }
            if let Some(fragment) = &fragment {
                s.push('_');
                s.push_str(fragment);
            }
            s
        }
    };

    match ctx.file_type {
        FileType::ModelContributionRaw => {
            if ctx.turn_index > 0 {
                stem.push_str(&format!("{CONTINUATION_MARKER}{}", ctx.turn_index));
            }
            stem.push_str(RAW_SUFFIX);
        }
        FileType::HeaderContext => stem.push_str(HEADER_SUFFIX),
        FileType::AssembledDocumentJson => stem.push_str(ASSEMBLED_SUFFIX),
        FileType::RenderedDocument => stem.push_str(RENDERED_SUFFIX),
    }

    StoragePath {
        storage_path,
        file_name: stem,
    }
}

/// Fields recovered from a file name built by [`construct_storage_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFileName {
    pub file_type: FileType,
    pub model_slug: String,
    pub source_anchor_model_slug: Option<String>,
    pub fragment: Option<String>,
    pub attempt: u32,
    pub document_key: String,
    pub turn_index: u32,
}

/// Parse the file name at the end of `path`. Returns `None` for names this
/// crate does not produce.
pub fn deconstruct_storage_path(path: &str) -> Option<ParsedFileName> {
    let file_name = path.rsplit('/').next()?;

    let (file_type, mut stem) = if let Some(stem) = file_name.strip_suffix(HEADER_SUFFIX) {
        (FileType::HeaderContext, stem)
    } else if let Some(stem) = file_name.strip_suffix(ASSEMBLED_SUFFIX) {
        (FileType::AssembledDocumentJson, stem)
    } else if let Some(stem) = file_name.strip_suffix(RAW_SUFFIX) {
        (FileType::ModelContributionRaw, stem)
    } else if let Some(stem) = file_name.strip_suffix(RENDERED_SUFFIX) {
        (FileType::RenderedDocument, stem)
    } else {
        return None;
    };

    let mut turn_index = 0;
    if file_type == FileType::ModelContributionRaw
        && let Some((head, turn)) = stem.rsplit_once(CONTINUATION_MARKER)
        && let Ok(turn) = turn.parse::<u32>()
    {
        turn_index = turn;
        stem = head;
    }

    let header = file_type == FileType::HeaderContext;

    let parsed = if let Some((model, rest)) = stem.split_once(CRITIQUE_MARKER) {
        let (anchor, rest) = rest.split_once('_')?;
        let tokens: Vec<&str> = rest.split('_').collect();
        let has_fragment = tokens.len() > 1 && is_fragment(tokens[0]) && is_number(tokens[1]);
        let (fragment, tokens) = if has_fragment {
            (Some(tokens[0].to_string()), &tokens[1..])
        } else {
            (None, &tokens[..])
        };
        let attempt = tokens.first()?.parse().ok()?;
        let document_key = if header {
            "header_context".to_string()
        } else {
            tokens.get(1..).filter(|t| !t.is_empty())?.join("_")
        };
        ParsedFileName {
            file_type,
            model_slug: model.to_string(),
            source_anchor_model_slug: Some(anchor.to_string()),
            fragment,
            attempt,
            document_key,
            turn_index,
        }
    } else {
        let tokens: Vec<&str> = stem.split('_').collect();
        let model = tokens.first()?;
        let attempt = tokens.get(1)?.parse().ok()?;
        let rest = tokens.get(2..).unwrap_or_default();
        let (fragment, document_key) = if header {
            match rest {
                [] => (None, "header_context".to_string()),
                [fragment] if is_fragment(fragment) => {
                    (Some(fragment.to_string()), "header_context".to_string())
                }
                _ => return None,
            }
        } else {
            match rest.split_last() {
                Some((last, key)) if !key.is_empty() && is_fragment(last) => {
                    (Some(last.to_string()), key.join("_"))
                }
                Some(_) => (None, rest.join("_")),
                None => return None,
            }
        };
        ParsedFileName {
            file_type,
            model_slug: model.to_string(),
            source_anchor_model_slug: None,
            fragment,
            attempt,
            document_key,
            turn_index,
        }
    };

    Some(parsed)
}

fn is_fragment(token: &str) -> bool {
    token.len() == 8
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn is_number(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_digit())
}
