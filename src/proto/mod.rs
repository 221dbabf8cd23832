//! Wire types exchanged with the management service.

pub mod log;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use log::{Level, LogEntry};

/// Service name of the agent itself.
pub const AGENT_SERVICE: &str = "agent";

/// A command from the management service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cmd {
    pub id: String,
    #[serde(default = "Utc::now")]
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub agent_uuid: String,
    pub service: String,
    pub cmd: String,
    /// Verb-specific payload, usually a JSON document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Reply to exactly one [`Cmd`], correlated by `id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Errors carried back to the management service in a [`Reply`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CmdError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unknown command: {cmd} (service {service})")]
    UnknownCommand { service: String, cmd: String },

    #[error("invalid {cmd} payload: {reason}")]
    InvalidPayload { cmd: String, reason: String },

    #[error("{0} is already running")]
    ServiceIsRunning(String),

    #[error("{0} is not running")]
    ServiceIsNotRunning(String),
}

impl Cmd {
    pub fn new(service: &str, cmd: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ts: Utc::now(),
            service: service.to_string(),
            cmd: cmd.to_string(),
            ..Default::default()
        }
    }

    /// Attach a serialized payload.
    pub fn with_data<T: Serialize>(mut self, data: &T) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }

    /// Decode the payload into the verb's schema.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, CmdError> {
        let value = self.data.clone().ok_or_else(|| CmdError::InvalidPayload {
            cmd: self.cmd.clone(),
            reason: "missing data".to_string(),
        })?;

        serde_json::from_value(value).map_err(|e| CmdError::InvalidPayload {
            cmd: self.cmd.clone(),
            reason: e.to_string(),
        })
    }

    /// Successful reply carrying `data`.
    pub fn reply<T: Serialize>(&self, data: &T) -> Reply {
        match serde_json::to_value(data) {
            Ok(value) => Reply {
                id: self.id.clone(),
                data: Some(value),
                error: String::new(),
            },
            Err(e) => self.reply_err(format!("serializing reply: {e}")),
        }
    }

    /// Successful reply without data.
    pub fn reply_ok(&self) -> Reply {
        Reply {
            id: self.id.clone(),
            data: None,
            error: String::new(),
        }
    }

    /// Error reply.
    pub fn reply_err(&self, error: impl fmt::Display) -> Reply {
        Reply {
            id: self.id.clone(),
            data: None,
            error: error.to_string(),
        }
    }

    /// Reply from a handler result.
    pub fn reply_result<T: Serialize>(&self, res: anyhow::Result<T>) -> Reply {
        match res {
            Ok(data) => self.reply(&data),
            Err(e) => self.reply_err(format!("{e:#}")),
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Cmd ts={} user={} service={} cmd={} id={}]",
            self.ts.format("%Y-%m-%dT%H:%M:%SZ"),
            self.user,
            self.service,
            self.cmd,
            self.id,
        )
    }
}

impl Reply {
    pub fn is_err(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Payload of agent `StartService`/`StopService`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// One entry of `GetConfig`/`GetAllConfigs`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfigEntry {
    pub service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    /// Configuration as persisted on disk.
    pub set: String,
    /// Configuration currently in effect.
    pub running: String,
}

/// Payload of the `Version` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub running: String,
}
