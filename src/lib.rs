//! Multi-stage, multi-model document generation.
//!
//! A session walks five stages (thesis, antithesis, synthesis, parenthesis,
//! paralysis). Each stage is planned into one root PLAN job per selected
//! model; workers expand those into EXECUTE and RENDER jobs, call the models
//! and store the artifacts, and the session advances once every root job of
//! the stage has completed.

pub mod anthropic;
pub mod artifact;
pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod notify;
pub mod planner;
pub mod progression;
pub mod recipe;
pub mod session;
pub mod state_machine;
pub mod store;
pub mod ui;
pub mod worker;

pub use error::{ApiError, DialecticError, Result};
