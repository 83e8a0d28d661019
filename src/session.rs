//! Projects, sessions and the fixed stage sequence a session walks through.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// The ordered stages of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Thesis,
    Antithesis,
    Synthesis,
    Parenthesis,
    Paralysis,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Thesis,
        Stage::Antithesis,
        Stage::Synthesis,
        Stage::Parenthesis,
        Stage::Paralysis,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            Stage::Thesis => "thesis",
            Stage::Antithesis => "antithesis",
            Stage::Synthesis => "synthesis",
            Stage::Parenthesis => "parenthesis",
            Stage::Paralysis => "paralysis",
        }
    }

    /// 1-based position, used in storage directory names.
    pub fn index(&self) -> usize {
        match self {
            Stage::Thesis => 1,
            Stage::Antithesis => 2,
            Stage::Synthesis => 3,
            Stage::Parenthesis => 4,
            Stage::Paralysis => 5,
        }
    }

    pub fn next(&self) -> Option<Stage> {
        Stage::ALL.get(self.index()).copied()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.slug() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

/// Session workflow status: `pending_<stage>`, `running_<stage>`, or done for review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Pending(Stage),
    Running(Stage),
    IterationCompletePendingReview,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Pending(stage) => write!(f, "pending_{stage}"),
            SessionStatus::Running(stage) => write!(f, "running_{stage}"),
            SessionStatus::IterationCompletePendingReview => {
                f.write_str("iteration_complete_pending_review")
            }
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "iteration_complete_pending_review" {
            return Ok(SessionStatus::IterationCompletePendingReview);
        }
        if let Some(stage) = s.strip_prefix("pending_") {
            return Ok(SessionStatus::Pending(stage.parse()?));
        }
        if let Some(stage) = s.strip_prefix("running_") {
            return Ok(SessionStatus::Running(stage.parse()?));
        }
        Err(format!("unknown session status '{s}'"))
    }
}

impl Serialize for SessionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub owner_user_id: String,
    pub name: String,
    pub initial_user_prompt: String,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(owner_user_id: &str, name: &str, initial_user_prompt: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_user_id: owner_user_id.to_string(),
            name: name.to_string(),
            initial_user_prompt: initial_user_prompt.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub project_id: Uuid,
    pub status: SessionStatus,
    pub current_stage: Stage,
    pub iteration_count: u32,
    pub selected_model_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A new session at the first stage of iteration 1.
    pub fn new(project_id: Uuid, selected_model_ids: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            status: SessionStatus::Pending(Stage::Thesis),
            current_stage: Stage::Thesis,
            iteration_count: 1,
            selected_model_ids,
            created_at: now,
            updated_at: now,
        }
    }
}

/// First eight characters of an id with hyphens removed, lowercased.
pub fn short_id(id: &str) -> String {
    id.chars()
        .filter(|c| *c != '-')
        .take(8)
        .collect::<String>()
        .to_lowercase()
}
