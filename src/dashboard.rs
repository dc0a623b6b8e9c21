//! Query and command surface for the dashboard.
//!
//! [`Dashboard`] is what the HTTP routes call; it can equally be embedded by
//! an in-process UI. Commands are small presets that build a Call, plus a
//! `raw` escape hatch.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::CommandError;
use crate::ocpp::{Action, CorrelationId, Frame};
use crate::pipeline::StageInfo;
use crate::sessions::{FramePage, SessionManager, SessionSummary};
use crate::status::StatusSnapshot;

/// A dashboard command, delivered to the device as a backend Call.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Reset {
        #[serde(default = "default_reset_kind")]
        kind: String,
    },
    RemoteStop {
        transaction_id: i64,
    },
    GetConfiguration {
        #[serde(default)]
        keys: Option<Vec<String>>,
    },
    TriggerMessage {
        requested_message: String,
        #[serde(default)]
        connector_id: Option<i64>,
    },
    Raw {
        action: Action,
        #[serde(default = "empty_object")]
        payload: Value,
    },
}

fn default_reset_kind() -> String {
    "Soft".into()
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Command {
    pub fn into_frame(self, id: CorrelationId) -> Frame {
        let (action, payload) = match self {
            Self::Reset { kind } => (Action::Reset, json!({ "type": kind })),
            Self::RemoteStop { transaction_id } => (
                Action::RemoteStopTransaction,
                json!({ "transactionId": transaction_id }),
            ),
            Self::GetConfiguration { keys } => (
                Action::GetConfiguration,
                keys.map_or_else(|| json!({}), |keys| json!({ "key": keys })),
            ),
            Self::TriggerMessage {
                requested_message,
                connector_id,
            } => {
                let mut payload = json!({ "requestedMessage": requested_message });
                if let Some(connector_id) = connector_id {
                    payload["connectorId"] = json!(connector_id);
                }
                (Action::TriggerMessage, payload)
            }
            Self::Raw { action, payload } => (action, payload),
        };
        Frame::call(id, action, payload)
    }
}

#[derive(Clone)]
pub struct Dashboard {
    sessions: SessionManager,
}

impl Dashboard {
    pub fn new(sessions: SessionManager) -> Self {
        Self { sessions }
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        self.sessions.list().await
    }

    pub async fn snapshot(&self, id: &str) -> Option<StatusSnapshot> {
        self.sessions.status().snapshot(id).await
    }

    pub async fn frames(&self, id: &str, since: u64, wait: Option<Duration>) -> Option<FramePage> {
        self.sessions.frames(id, since, wait).await
    }

    pub fn rules(&self) -> Vec<StageInfo> {
        self.sessions.pipeline().describe()
    }

    /// Queue `command` for the session's device. Returns the id it was sent
    /// with, unless the relay had to reissue it.
    pub async fn send_command(&self, id: &str, command: Command) -> Result<CorrelationId, CommandError> {
        let request_id = CorrelationId::from(format!("dash-{}", Uuid::new_v4()));
        self.sessions
            .send_command(id, command.into_frame(request_id.clone()))
            .await?;
        Ok(request_id)
    }

    pub async fn close_session(&self, id: &str) -> bool {
        self.sessions.close(id).await
    }

    /// Drop identity payloads cached for a charge point.
    pub async fn forget_identity(&self, id: &str) -> bool {
        self.sessions.identity().forget(id).await
    }
}
