//! Declarative stage recipes: which steps a stage runs, what each step reads
//! and what it produces.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::artifact::ResourceType;
use crate::error::{DialecticError, Result};
use crate::session::Stage;
use crate::state_machine::JobType;

const BUILTIN_RECIPES: &str = include_str!("../recipes/default.toml");

/// Stage filter value that matches every stage.
pub const ANY_STAGE: &str = "any";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// A rendered markdown document.
    Document,
    HeaderContext,
    AssembledJson,
}

impl InputKind {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            InputKind::Document => ResourceType::RenderedDocument,
            InputKind::HeaderContext => ResourceType::HeaderContext,
            InputKind::AssembledJson => ResourceType::AssembledJson,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRule {
    #[serde(rename = "type")]
    pub kind: InputKind,
    /// Stage slug the input comes from, or `any`.
    pub slug: String,
    pub document_key: String,
    #[serde(default = "default_required")]
    pub required: bool,
    /// The document this step critiques; its model names the output files.
    #[serde(default)]
    pub anchor: bool,
}

fn default_required() -> bool {
    true
}

impl InputRule {
    pub fn stage(&self) -> Option<Stage> {
        self.slug.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactClass {
    HeaderContext,
    AssembledJson,
    RenderedDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Json,
    Markdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextForDocument {
    pub document_key: String,
    pub content_to_include: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRule {
    pub document_key: String,
    pub artifact_class: ArtifactClass,
    pub file_type: OutputFormat,
    #[serde(default)]
    pub context_for_documents: Vec<ContextForDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderReason {
    IsJson,
    IsMarkdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderDecision {
    pub should_render: bool,
    pub reason: RenderReason,
}

impl OutputRule {
    /// JSON artifacts are never rendered.
    pub fn should_render(&self) -> RenderDecision {
        match self.file_type {
            OutputFormat::Json => RenderDecision {
                should_render: false,
                reason: RenderReason::IsJson,
            },
            OutputFormat::Markdown => RenderDecision {
                should_render: true,
                reason: RenderReason::IsMarkdown,
            },
        }
    }

    /// Resource the EXECUTE job itself registers for this output, if any.
    /// Rendered documents only exist once the RENDER child has run.
    pub fn execute_output(&self) -> Option<ResourceType> {
        match self.artifact_class {
            ArtifactClass::HeaderContext => Some(ResourceType::HeaderContext),
            ArtifactClass::AssembledJson => Some(ResourceType::AssembledJson),
            ArtifactClass::RenderedDocument => None,
        }
    }

    /// Every resource type this output eventually produces.
    pub fn produces(&self) -> ResourceType {
        self.execute_output()
            .unwrap_or(ResourceType::RenderedDocument)
    }

    pub fn sections_for(&self, document_key: &str) -> Option<&[String]> {
        self.context_for_documents
            .iter()
            .find(|c| c.document_key == document_key)
            .map(|c| c.content_to_include.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeStep {
    pub step_slug: String,
    pub name: String,
    #[serde(default = "default_job_type")]
    pub job_type: JobType,
    pub instructions: String,
    #[serde(default)]
    pub inputs_required: Vec<InputRule>,
    pub outputs_required: OutputRule,
}

fn default_job_type() -> JobType {
    JobType::Execute
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub stage: Stage,
    pub steps: Vec<RecipeStep>,
}

impl Recipe {
    pub fn step(&self, step_slug: &str) -> Option<&RecipeStep> {
        self.steps.iter().find(|s| s.step_slug == step_slug)
    }

    /// The step in this recipe whose output satisfies `rule`, if the rule is same-stage.
    pub fn producer_of(&self, rule: &InputRule) -> Option<&RecipeStep> {
        if rule.stage() != Some(self.stage) {
            return None;
        }
        self.steps.iter().find(|s| {
            s.outputs_required.document_key == rule.document_key
                && s.outputs_required.produces() == rule.kind.resource_type()
        })
    }
}

/// Read access to stage recipes.
pub trait RecipeRepository: Send + Sync {
    fn recipe_for(&self, stage: Stage) -> Option<&Recipe>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipeBook {
    #[serde(default)]
    pub recipes: Vec<Recipe>,
}

impl RecipeRepository for RecipeBook {
    fn recipe_for(&self, stage: Stage) -> Option<&Recipe> {
        self.recipes.iter().find(|r| r.stage == stage)
    }
}

impl RecipeBook {
    /// The recipes shipped with the crate.
    pub fn builtin() -> Result<Self> {
        Self::parse(BUILTIN_RECIPES)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let book: RecipeBook = toml::from_str(contents)?;
        book.validate()?;
        Ok(book)
    }

    /// Reject recipes the planner could never expand.
    pub fn validate(&self) -> Result<()> {
        let mut stages = HashSet::new();
        for recipe in &self.recipes {
            if !stages.insert(recipe.stage) {
                return Err(config_err(recipe.stage, "stage defined twice"));
            }

            let mut slugs = HashSet::new();
            let mut outputs = HashSet::new();
            for step in &recipe.steps {
                if !slugs.insert(step.step_slug.as_str()) {
                    return Err(config_err(
                        recipe.stage,
                        &format!("duplicate step '{}'", step.step_slug),
                    ));
                }
                if !outputs.insert(step.outputs_required.document_key.as_str()) {
                    return Err(config_err(
                        recipe.stage,
                        &format!(
                            "document '{}' produced twice",
                            step.outputs_required.document_key
                        ),
                    ));
                }
                if step.job_type != JobType::Execute {
                    return Err(config_err(
                        recipe.stage,
                        &format!("step '{}' must be an EXECUTE step", step.step_slug),
                    ));
                }

                let out = &step.outputs_required;
                let consistent = matches!(
                    (out.artifact_class, out.file_type),
                    (ArtifactClass::HeaderContext, OutputFormat::Json)
                        | (ArtifactClass::AssembledJson, OutputFormat::Json)
                        | (ArtifactClass::RenderedDocument, OutputFormat::Markdown)
                );
                if !consistent {
                    return Err(config_err(
                        recipe.stage,
                        &format!("step '{}' has mismatched artifact and file type", step.step_slug),
                    ));
                }

                for rule in &step.inputs_required {
                    self.validate_input(recipe, step, rule)?;
                }
            }
        }
        Ok(())
    }

    fn validate_input(&self, recipe: &Recipe, step: &RecipeStep, rule: &InputRule) -> Result<()> {
        if rule.slug == ANY_STAGE {
            return Ok(());
        }
        let Some(source) = rule.stage() else {
            return Err(config_err(
                recipe.stage,
                &format!("step '{}' reads from unknown stage '{}'", step.step_slug, rule.slug),
            ));
        };
        if source > recipe.stage {
            return Err(config_err(
                recipe.stage,
                &format!("step '{}' reads from later stage '{source}'", step.step_slug),
            ));
        }
        if source == recipe.stage {
            match recipe.producer_of(rule) {
                Some(producer) if producer.step_slug == step.step_slug => {
                    return Err(config_err(
                        recipe.stage,
                        &format!("step '{}' reads its own output", step.step_slug),
                    ));
                }
                Some(_) => {}
                None => {
                    return Err(config_err(
                        recipe.stage,
                        &format!(
                            "step '{}' reads '{}' which no step produces",
                            step.step_slug, rule.document_key
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn config_err(stage: Stage, msg: &str) -> DialecticError {
    DialecticError::Config(format!("recipe '{stage}': {msg}"))
}
