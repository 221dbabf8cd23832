use std::collections::BTreeMap;
use std::future::Future;

use anyhow::Result;

use crate::proto::{AgentConfigEntry, Cmd, Reply};

/// Uniform lifecycle of an agent subsystem.
pub trait ServiceManager: Send + Sync {
    /// Service name commands are routed by.
    fn name(&self) -> &'static str;

    /// Start the service from its persisted configuration.
    fn start(&self) -> impl Future<Output = Result<()>> + Send;

    /// Stop the service. Stopping a stopped service is not an error.
    fn stop(&self) -> impl Future<Output = Result<()>> + Send;

    /// Handle one command addressed to this service.
    fn handle(&self, cmd: &Cmd) -> impl Future<Output = Reply> + Send;

    /// Status fields of this service.
    fn status(&self) -> BTreeMap<String, String>;

    /// Persisted and running configuration, plus per-entry errors.
    fn get_config(&self) -> (Vec<AgentConfigEntry>, Vec<String>);

    /// Whether the service is running.
    fn is_running(&self) -> bool;
}

/// The fixed set of subsystems the agent routes commands to.
///
/// Uses enum dispatch rather than trait objects so the trait can keep
/// native async methods.
pub enum Manager {
    Log(crate::logrelay::Manager),
    Data(crate::spool::Manager),
    Qan(crate::qan::Manager),
    Instance(crate::instance::Manager),
}

macro_rules! dispatch {
    ($self:ident, $m:ident => $body:expr) => {
        match $self {
            Self::Log($m) => $body,
            Self::Data($m) => $body,
            Self::Qan($m) => $body,
            Self::Instance($m) => $body,
        }
    };
}

impl Manager {
    pub fn name(&self) -> &'static str {
        dispatch!(self, m => m.name())
    }

    pub async fn start(&self) -> Result<()> {
        dispatch!(self, m => m.start().await)
    }

    pub async fn stop(&self) -> Result<()> {
        dispatch!(self, m => m.stop().await)
    }

    pub async fn handle(&self, cmd: &Cmd) -> Reply {
        dispatch!(self, m => m.handle(cmd).await)
    }

    pub fn status(&self) -> BTreeMap<String, String> {
        dispatch!(self, m => m.status())
    }

    pub fn get_config(&self) -> (Vec<AgentConfigEntry>, Vec<String>) {
        dispatch!(self, m => m.get_config())
    }

    pub fn is_running(&self) -> bool {
        dispatch!(self, m => m.is_running())
    }
}

/// Render a config value the way `GetConfig` reports it.
pub fn config_string<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
