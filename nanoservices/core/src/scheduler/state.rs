//! Orchestration actions and the pure decisions between them.

use chrono::{DateTime, Utc};
use relayflow_utils::error::Error;
use relayflow_utils::FlowResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobArgs;
use crate::schedule;
use crate::store::models::Connection;

/// Identity of one orchestration execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInput {
    pub connection_id: String,
    #[serde(default)]
    pub restart_count: u32,
}

/// The envelope passed between orchestration steps, serialized as
/// `{"action": "WAIT", "until": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    BeforeSync,
    Run { token: String, job: JobArgs },
    AfterSync,
    Wait { until: DateTime<Utc> },
    AfterSleep,
    Loop,
    Terminate,
}

const KNOWN_ACTIONS: &[&str] = &[
    "BEFORE_SYNC",
    "RUN",
    "AFTER_SYNC",
    "WAIT",
    "AFTER_SLEEP",
    "LOOP",
    "TERMINATE",
];

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::BeforeSync => "BEFORE_SYNC",
            Action::Run { .. } => "RUN",
            Action::AfterSync => "AFTER_SYNC",
            Action::Wait { .. } => "WAIT",
            Action::AfterSleep => "AFTER_SLEEP",
            Action::Loop => "LOOP",
            Action::Terminate => "TERMINATE",
        }
    }

    pub fn to_envelope(&self) -> FlowResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a persisted envelope. An unrecognised tag is a configuration
    /// error distinct from a malformed payload.
    pub fn from_envelope(envelope: &Value) -> FlowResult<Self> {
        let tag = envelope
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::UnknownAction(envelope.to_string()))?;
        if !KNOWN_ACTIONS.contains(&tag) {
            return Err(Error::UnknownAction(tag.to_string()));
        }
        Ok(serde_json::from_value(envelope.clone())?)
    }
}

/// After a run: sleep until the next fire time strictly after `now`.
pub fn after_sync(expr: &str, now: DateTime<Utc>) -> FlowResult<Action> {
    let until = schedule::next_fire(expr, now)?;
    Ok(Action::Wait { until })
}

/// On waking: stop if the connection is gone or someone else holds its token;
/// otherwise loop if a fire time anchored at the last run has already passed,
/// or sleep again until it.
pub fn after_sleep(connection: Option<&Connection>, now: DateTime<Utc>) -> FlowResult<Action> {
    let Some(connection) = connection else {
        return Ok(Action::Terminate);
    };
    if connection.run_token.is_some() {
        return Ok(Action::Terminate);
    }
    let anchor = connection.last_ran_at.unwrap_or(now);
    let next = schedule::next_fire(&connection.schedule, anchor)?;
    if next <= now {
        Ok(Action::Loop)
    } else {
        Ok(Action::Wait { until: next })
    }
}
