//! Operator commands carried in the action label
//!
//! A resource holds at most one pending command in [`ACTION_LABEL`]. The
//! command is consumed exactly once: after the reconcile pass acts on it,
//! the label is cleared, whether the value was recognized or not.

use std::collections::BTreeMap;
use std::str::FromStr;

use tracing::{info, warn};

use crate::adapters::{Advisory, ResourceClient, ResourceRef};
use crate::error::Result;

/// Label carrying a pending command
pub const ACTION_LABEL: &str = "postgres.oso.sh/action";

/// Recognized commands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    ResetPassword,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::ResetPassword => "reset-password",
        }
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reset-password" => Ok(Command::ResetPassword),
            other => Err(other.to_string()),
        }
    }
}

/// The single command slot of a resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionSlot {
    value: Option<String>,
}

impl ActionSlot {
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self {
            value: labels.get(ACTION_LABEL).cloned(),
        }
    }

    /// Recognized pending command
    pub fn command(&self) -> Option<Command> {
        self.value.as_deref().and_then(|v| v.parse().ok())
    }

    /// Consume the slot: report the outcome and clear the label.
    ///
    /// `confirmation` is published for a recognized command; an unknown
    /// value is reported as a warning and dropped.
    pub async fn acknowledge(
        self,
        resources: &dyn ResourceClient,
        resource: &ResourceRef,
        confirmation: Option<&str>,
    ) -> Result<()> {
        let Some(value) = self.value else {
            return Ok(());
        };

        match value.parse::<Command>() {
            Ok(command) => {
                info!(name = %resource.name, command = command.as_str(), "Executed action");
                if let Some(message) = confirmation {
                    resources
                        .publish(resource, &Advisory::normal("Action", message))
                        .await;
                }
            }
            Err(unknown) => {
                warn!(name = %resource.name, action = %unknown, "Unknown action");
                resources
                    .publish(
                        resource,
                        &Advisory::warning("UnknownAction", format!("Unknown action: {}", unknown)),
                    )
                    .await;
            }
        }

        resources.clear_action_label(resource).await
    }
}
