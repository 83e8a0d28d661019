//! User notifications for job lifecycle edges.
//!
//! Status cascades queue notifications on the transaction's [`Tables`]; the
//! store hands them to its [`Notifier`] only after the transaction commits,
//! so a rolled-back write never announces anything.
//!
//! [`Tables`]: crate::store::Tables

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};
use uuid::Uuid;

use crate::session::{SessionStatus, Stage};

/// One lifecycle event, addressed to the owner of the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub target_user_id: String,
    pub session_id: Uuid,
    pub stage: Stage,
    #[serde(flatten)]
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "notification_type", rename_all = "snake_case")]
pub enum Event {
    /// A root PLAN job was claimed for the first time.
    ContributionGenerationStarted { job_id: Uuid, model_id: String },
    ContributionGenerationRetrying {
        job_id: Uuid,
        /// Attempt that just failed.
        attempt: u32,
        max_retries: u32,
        retry_at: Option<DateTime<Utc>>,
    },
    /// An EXECUTE job stored model output.
    DialecticContributionReceived {
        job_id: Uuid,
        model_id: String,
        document_key: String,
        is_continuing: bool,
    },
    /// Every root of the stage completed and the session advanced.
    ContributionGenerationComplete { status: SessionStatus },
    /// A root PLAN job ended in failure.
    ContributionGenerationFailed {
        job_id: Uuid,
        model_id: String,
        code: Option<String>,
        message: Option<String>,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ContributionGenerationStarted { .. } => "contribution_generation_started",
            Event::ContributionGenerationRetrying { .. } => "contribution_generation_retrying",
            Event::DialecticContributionReceived { .. } => "dialectic_contribution_received",
            Event::ContributionGenerationComplete { .. } => "contribution_generation_complete",
            Event::ContributionGenerationFailed { .. } => "contribution_generation_failed",
        }
    }
}

/// Delivers committed notifications. Called outside the store lock.
pub trait Notifier: Send + Sync + Debug {
    fn notify(&self, notification: &Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) {
        info!(
            user = %notification.target_user_id,
            session_id = %notification.session_id,
            stage = %notification.stage,
            kind = notification.event.kind(),
            "notification"
        );
    }
}

/// Forwards notifications into a channel for an async consumer.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new(sender: UnboundedSender<Notification>) -> Self {
        Self { sender }
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: &Notification) {
        if self.sender.send(notification.clone()).is_err() {
            debug!(kind = notification.event.kind(), "notification receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn started() -> Notification {
        Notification {
            target_user_id: "user-1".into(),
            session_id: Uuid::nil(),
            stage: Stage::Thesis,
            event: Event::ContributionGenerationStarted {
                job_id: Uuid::nil(),
                model_id: "claude-sonnet".into(),
            },
        }
    }

    #[test]
    fn wire_format_is_flat_and_tagged() {
        let json = serde_json::to_value(started()).unwrap();
        assert_eq!(json["notification_type"], "contribution_generation_started");
        assert_eq!(json["target_user_id"], "user-1");
        assert_eq!(json["stage"], "thesis");
        assert_eq!(json["model_id"], "claude-sonnet");
    }

    #[test]
    fn channel_notifier_forwards_and_tolerates_closed_receiver() {
        let (tx, mut rx) = unbounded_channel();
        let notifier = ChannelNotifier::new(tx);
        notifier.notify(&started());
        assert_eq!(rx.try_recv().unwrap(), started());

        drop(rx);
        notifier.notify(&started());
    }
}
