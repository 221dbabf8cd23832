//! Command dispatcher: routes commands from the control link to the service
//! managers and handles the agent's own verbs.

pub mod restart;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::Link;
use crate::config::AgentConfig;
use crate::context::AgentContext;
use crate::health::HealthMetrics;
use crate::proto::{
    AgentConfigEntry, Cmd, CmdError, Reply, ServiceData, Version, AGENT_SERVICE,
};
use crate::service::{config_string, Manager};

/// The control link: commands in, replies out.
pub type CmdLink = dyn Link<Cmd, Reply>;

/// How long shutdown waits for in-flight commands.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const STATUS_FIELD: &str = "agent";

/// Payload of agent `SetConfig`. Absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub keepalive: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_addr: Option<String>,
}

/// Central dispatcher.
///
/// Every command runs in its own task, so a slow `StartService` does not hold
/// up a `Status`. A handler that panics is answered with an error reply.
pub struct Agent {
    ctx: AgentContext,
    config: parking_lot::RwLock<AgentConfig>,
    services: BTreeMap<&'static str, Arc<Manager>>,
    link: Arc<CmdLink>,
    /// Cancelled once a `Restart` handed over to the replacement binary.
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(
        ctx: AgentContext,
        config: AgentConfig,
        link: Arc<CmdLink>,
        services: Vec<Manager>,
    ) -> Self {
        let services = services
            .into_iter()
            .map(|m| (m.name(), Arc::new(m)))
            .collect();

        Self {
            ctx,
            config: parking_lot::RwLock::new(config),
            services,
            link,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn service(&self, name: &str) -> Option<Arc<Manager>> {
        self.services.get(name).map(Arc::clone)
    }

    /// Token cancelled when the agent should exit after a restart handover.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> AgentConfig {
        self.config.read().clone()
    }

    /// Start every service from its persisted config, in registration
    /// order. A service that fails to start is logged and left stopped.
    pub async fn start_services(&self, order: &[&str]) {
        for name in order {
            let Some(m) = self.services.get(*name) else {
                continue;
            };

            match m.start().await {
                Ok(()) => info!(service = *name, "service started"),
                Err(e) => error!(service = *name, error = %format!("{e:#}"), "cannot start service"),
            }
        }
    }

    /// Stop services in reverse `order`.
    pub async fn stop_services(&self, order: &[&str]) {
        for name in order.iter().rev() {
            let Some(m) = self.services.get(*name) else {
                continue;
            };
            if !m.is_running() {
                continue;
            }

            match m.stop().await {
                Ok(()) => info!(service = *name, "service stopped"),
                Err(e) => warn!(service = *name, error = %format!("{e:#}"), "error stopping service"),
            }
        }
    }

    /// Connect the control link and serve commands until `cancel` fires,
    /// a restart hands over, or the link goes away.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut rx = self
            .link
            .recv_chan()
            .context("control link receiver already taken")?;

        self.link.connect();
        self.ctx.status.update(AGENT_SERVICE, STATUS_FIELD, "Ready");
        info!("agent ready for commands");

        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.shutdown.cancelled() => {
                    info!("restart handed over, agent exiting");
                    break;
                }
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else {
                        warn!("control link closed");
                        break;
                    };
                    self.ctx.health.cmds_received.inc();
                    tasks.spawn(Arc::clone(&self).run_cmd(cmd));
                }
                Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = res {
                        error!(critical = true, error = %e, "command task failed");
                    }
                }
            }
        }

        self.ctx.status.update(AGENT_SERVICE, STATUS_FIELD, "Stopping");

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(pending = tasks.len(), "abandoning in-flight commands");
            tasks.abort_all();
        }

        self.link.disconnect();
        self.ctx.status.update(AGENT_SERVICE, STATUS_FIELD, "Stopped");

        Ok(())
    }

    async fn run_cmd(self: Arc<Self>, cmd: Cmd) {
        let started = Instant::now();
        debug!(cmd = %cmd, cmd_id = %cmd.id, "command received");

        let agent = Arc::clone(&self);
        let inner = cmd.clone();
        let reply = guarded(&cmd, &self.ctx.health, async move { agent.handle(&inner).await }).await;

        if reply.is_err() {
            warn!(
                cmd = %cmd,
                cmd_id = %cmd.id,
                error = %reply.error,
                "command failed",
            );
        } else {
            debug!(cmd_id = %cmd.id, elapsed = ?started.elapsed(), "command done");
        }

        let handed_over = cmd.service == AGENT_SERVICE && cmd.cmd == "Restart" && !reply.is_err();

        self.send_reply(reply).await;

        if handed_over {
            self.shutdown.cancel();
        }
    }

    async fn send_reply(&self, reply: Reply) {
        let id = reply.id.clone();
        if self.link.send_chan().send(reply).await.is_err() {
            warn!(cmd_id = %id, "control link gone, reply lost");
            return;
        }
        self.ctx.health.replies_sent.inc();
    }

    /// Route one command and produce its reply.
    pub async fn handle(&self, cmd: &Cmd) -> Reply {
        if cmd.service == AGENT_SERVICE {
            return self.handle_agent(cmd).await;
        }

        match self.services.get(cmd.service.as_str()) {
            Some(m) => m.handle(cmd).await,
            None => cmd.reply_err(CmdError::UnknownService(cmd.service.clone())),
        }
    }

    async fn handle_agent(&self, cmd: &Cmd) -> Reply {
        self.ctx
            .status
            .update_re(AGENT_SERVICE, "agent-cmd-handler", "Handling", cmd);

        let reply = match cmd.cmd.as_str() {
            "StartService" => reply_unit(cmd, self.start_service(cmd).await),
            "StopService" => reply_unit(cmd, self.stop_service(cmd).await),
            "GetConfig" => match self.config_entry() {
                Ok(entry) => cmd.reply(&vec![entry]),
                Err(e) => cmd.reply_err(format!("{e:#}")),
            },
            "GetAllConfigs" => self.get_all_configs(cmd),
            "SetConfig" => reply_unit(cmd, self.set_config(cmd)),
            "Status" => cmd.reply(&self.status()),
            "Restart" => {
                info!(cmd = %cmd, "restarting agent");
                reply_unit(
                    cmd,
                    restart::self_restart(&self.ctx.basedir, restart::GRACE_PERIOD).await,
                )
            }
            "Version" => cmd.reply(&Version {
                running: crate::version::full(),
            }),
            "Ping" => cmd.reply_ok(),
            _ => cmd.reply_err(CmdError::UnknownCommand {
                service: AGENT_SERVICE.to_string(),
                cmd: cmd.cmd.clone(),
            }),
        };

        self.ctx
            .status
            .update(AGENT_SERVICE, "agent-cmd-handler", "Idle");

        reply
    }

    fn lookup(&self, name: &str) -> Result<&Arc<Manager>, CmdError> {
        self.services
            .get(name)
            .ok_or_else(|| CmdError::UnknownService(name.to_string()))
    }

    async fn start_service(&self, cmd: &Cmd) -> Result<()> {
        let data: ServiceData = cmd.payload()?;
        let m = self.lookup(&data.name)?;
        if m.is_running() {
            return Err(CmdError::ServiceIsRunning(data.name).into());
        }

        if let Some(config) = &data.config {
            self.ctx
                .basedir
                .write_config(&data.name, config)
                .with_context(|| format!("saving {} config", data.name))?;
        }

        m.start()
            .await
            .with_context(|| format!("starting {}", data.name))?;
        info!(service = %data.name, "service started");

        Ok(())
    }

    async fn stop_service(&self, cmd: &Cmd) -> Result<()> {
        let data: ServiceData = cmd.payload()?;
        let m = self.lookup(&data.name)?;
        if !m.is_running() {
            return Err(CmdError::ServiceIsNotRunning(data.name).into());
        }

        m.stop()
            .await
            .with_context(|| format!("stopping {}", data.name))?;
        info!(service = %data.name, "service stopped");

        Ok(())
    }

    fn set_config(&self, cmd: &Cmd) -> Result<()> {
        let settings: AgentSettings = cmd.payload()?;

        let mut cfg = self.config();
        if let Some(keepalive) = settings.keepalive {
            cfg.keepalive = keepalive;
        }
        if let Some(addr) = settings.health_addr {
            cfg.health_addr = addr;
        }
        cfg.validate()?;

        self.ctx
            .basedir
            .write_config(AGENT_SERVICE, &cfg)
            .context("saving agent config")?;

        info!(
            keepalive = ?cfg.keepalive,
            health_addr = %cfg.health_addr,
            "agent config updated, effective after restart",
        );
        *self.config.write() = cfg;

        Ok(())
    }

    fn config_entry(&self) -> Result<AgentConfigEntry> {
        let set = self
            .ctx
            .basedir
            .read_config::<AgentConfig>(AGENT_SERVICE)?
            .map(|cfg| config_string(&redacted(cfg)))
            .unwrap_or_default();

        Ok(AgentConfigEntry {
            service: AGENT_SERVICE.to_string(),
            set,
            running: config_string(&redacted(self.config())),
            ..Default::default()
        })
    }

    fn get_all_configs(&self, cmd: &Cmd) -> Reply {
        let mut configs = Vec::new();
        let mut errs = Vec::new();

        match self.config_entry() {
            Ok(entry) => configs.push(entry),
            Err(e) => errs.push(format!("{e:#}")),
        }

        for m in self.services.values() {
            let (entries, service_errs) = m.get_config();
            configs.extend(entries);
            errs.extend(service_errs);
        }

        let mut reply = cmd.reply(&configs);
        reply.error = errs.join("; ");
        reply
    }

    /// Every status field of the agent, its services and the control link.
    pub fn status(&self) -> BTreeMap<String, String> {
        let mut status = self.ctx.status.all();
        for m in self.services.values() {
            status.extend(m.status());
        }
        status.extend(self.link.status());
        status
    }
}

/// Run a command handler in its own task. A panic is counted, logged as
/// critical and turned into an error reply.
async fn guarded<F>(cmd: &Cmd, health: &HealthMetrics, handler: F) -> Reply
where
    F: Future<Output = Reply> + Send + 'static,
{
    match tokio::spawn(handler).await {
        Ok(reply) => reply,
        Err(e) => {
            health.cmd_panics.inc();
            error!(
                critical = true,
                cmd = %cmd,
                cmd_id = %cmd.id,
                error = %e,
                "command handler crashed",
            );
            cmd.reply_err(format!("{} {} crashed: {e}", cmd.service, cmd.cmd))
        }
    }
}

fn reply_unit(cmd: &Cmd, res: Result<()>) -> Reply {
    match res {
        Ok(()) => cmd.reply_ok(),
        Err(e) => cmd.reply_err(format!("{e:#}")),
    }
}

fn redacted(mut cfg: AgentConfig) -> AgentConfig {
    if !cfg.api_key.is_empty() {
        cfg.api_key = "<hidden>".to_string();
    }
    cfg
}
