use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use super::{open_log_file, LogLink, Relay};
use crate::config::LogConfig;
use crate::context::AgentContext;
use crate::proto::{AgentConfigEntry, Cmd, CmdError, Reply};
use crate::service::{config_string, ServiceManager};

const SERVICE: &str = "log";

/// The `log` service: persists `log.conf` and drives the relay.
pub struct Manager {
    ctx: AgentContext,
    relay: Arc<Relay>,
    link: Option<Arc<LogLink>>,
}

impl Manager {
    pub fn new(ctx: AgentContext, relay: Arc<Relay>, link: Option<Arc<LogLink>>) -> Self {
        Self { ctx, relay, link }
    }

    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    fn set_config(&self, cmd: &Cmd) -> Result<LogConfig> {
        let cfg: LogConfig = cmd.payload()?;

        if !cfg.file.is_empty() {
            open_log_file(&cfg.file)?;
        }

        self.ctx
            .basedir
            .write_config(SERVICE, &cfg)
            .context("saving log config")?;
        self.relay.set_config(cfg.clone());

        Ok(cfg)
    }
}

impl ServiceManager for Manager {
    fn name(&self) -> &'static str {
        SERVICE
    }

    async fn start(&self) -> Result<()> {
        if let Some(cfg) = self.ctx.basedir.read_config::<LogConfig>(SERVICE)? {
            self.relay.set_config(cfg);
        }

        if !self.relay.is_running() {
            self.relay.start()?;
        }
        info!(level = %self.relay.config().level, "log relay started");

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.relay.stop().await;
        Ok(())
    }

    async fn handle(&self, cmd: &Cmd) -> Reply {
        match cmd.cmd.as_str() {
            "GetConfig" => {
                let (configs, errs) = self.get_config();
                if errs.is_empty() {
                    cmd.reply(&configs)
                } else {
                    cmd.reply_err(errs.join("; "))
                }
            }
            "SetConfig" => cmd.reply_result(self.set_config(cmd)),
            "Status" => cmd.reply(&self.status()),
            _ => cmd.reply_err(CmdError::UnknownCommand {
                service: SERVICE.to_string(),
                cmd: cmd.cmd.clone(),
            }),
        }
    }

    fn status(&self) -> BTreeMap<String, String> {
        let mut status = self.ctx.status.service(SERVICE);
        if let Some(link) = &self.link {
            status.extend(link.status());
        }
        status
    }

    fn get_config(&self) -> (Vec<AgentConfigEntry>, Vec<String>) {
        let mut errs = Vec::new();

        let set = match self.ctx.basedir.read_config::<LogConfig>(SERVICE) {
            Ok(Some(cfg)) => config_string(&cfg),
            Ok(None) => String::new(),
            Err(e) => {
                errs.push(format!("{e:#}"));
                String::new()
            }
        };

        let running = if self.relay.is_running() {
            config_string(&self.relay.config())
        } else {
            String::new()
        };

        (
            vec![AgentConfigEntry {
                service: SERVICE.to_string(),
                set,
                running,
                ..Default::default()
            }],
            errs,
        )
    }

    fn is_running(&self) -> bool {
        self.relay.is_running()
    }
}
