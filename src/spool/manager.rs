use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use super::sender::{BlackholeTransport, HttpTransport, Sender, Transport};
use super::{SentReport, Spooler};
use crate::config::{AgentConfig, DataConfig};
use crate::context::AgentContext;
use crate::proto::{AgentConfigEntry, Cmd, CmdError, Reply};
use crate::service::{config_string, ServiceManager};

const SERVICE: &str = "data";
const SEND_TIMEOUT: Duration = Duration::from_secs(20);

/// Status field holding the spool size; refreshed by the sender after each
/// pass.
pub(crate) const USAGE_FIELD: &str = "data-spool";

pub(crate) fn usage_string((files, bytes): (usize, u64)) -> String {
    format!("{files} files, {bytes} bytes")
}

/// `Status` reply of the data service.
#[derive(Debug, serde::Serialize)]
struct DataStatus {
    status: BTreeMap<String, String>,
    sent: SentReport,
}

/// Owns the spool writer and the shipper.
pub struct Manager {
    ctx: AgentContext,
    agent: Arc<AgentConfig>,
    spool: Arc<Spooler>,
    config: parking_lot::Mutex<Option<DataConfig>>,
    sender: tokio::sync::Mutex<Option<Arc<Sender>>>,
    last_report: parking_lot::Mutex<SentReport>,
}

impl Manager {
    pub fn new(ctx: AgentContext, agent: Arc<AgentConfig>, spool: Arc<Spooler>) -> Self {
        Self {
            ctx,
            agent,
            spool,
            config: parking_lot::Mutex::new(None),
            sender: tokio::sync::Mutex::new(None),
            last_report: parking_lot::Mutex::new(SentReport::default()),
        }
    }

    pub fn spool(&self) -> Arc<Spooler> {
        Arc::clone(&self.spool)
    }

    fn load_config(&self) -> Result<DataConfig> {
        let cfg = self
            .ctx
            .basedir
            .read_config::<DataConfig>(SERVICE)?
            .unwrap_or_default();
        cfg.validate()?;
        Ok(cfg)
    }

    fn transport(&self, cfg: &DataConfig) -> Result<Arc<dyn Transport>> {
        if !cfg.blackhole.is_empty() {
            info!(file = %cfg.blackhole, "data blackhole enabled");
            return Ok(Arc::new(BlackholeTransport::new(PathBuf::from(&cfg.blackhole))));
        }

        let url = self.agent.link(SERVICE)?;
        let transport = HttpTransport::new(url, &self.agent.api_key, SEND_TIMEOUT)?;
        Ok(Arc::new(transport))
    }

    /// Stop any running sender and start one for `cfg`.
    async fn apply(&self, cfg: DataConfig) -> Result<()> {
        let transport = self.transport(&cfg)?;
        self.spool.set_gzip(cfg.gzip());

        let mut sender = self.sender.lock().await;
        if let Some(old) = sender.take() {
            *self.last_report.lock() = old.report();
            old.stop().await;
        }

        let new = Arc::new(Sender::new(
            Arc::clone(&self.spool),
            transport,
            cfg.send_interval,
            cfg.stats_window,
            Arc::clone(&self.ctx.status),
            Arc::clone(&self.ctx.health),
        ));
        new.start();
        *sender = Some(new);
        *self.config.lock() = Some(cfg);

        Ok(())
    }

    async fn set_config(&self, cmd: &Cmd) -> Result<DataConfig> {
        let cfg: DataConfig = cmd.payload()?;
        cfg.validate()?;

        self.ctx
            .basedir
            .write_config(SERVICE, &cfg)
            .context("saving data config")?;

        if self.is_running() {
            self.apply(cfg.clone()).await?;
        }

        Ok(cfg)
    }

    async fn sent_report(&self) -> SentReport {
        match self.sender.lock().await.as_ref() {
            Some(sender) => sender.report(),
            None => self.last_report.lock().clone(),
        }
    }
}

impl ServiceManager for Manager {
    fn name(&self) -> &'static str {
        SERVICE
    }

    async fn start(&self) -> Result<()> {
        let cfg = self.load_config()?;

        if !self.spool.is_running() {
            self.spool.start().context("starting spooler")?;
        }

        self.apply(cfg).await?;
        info!("data service started");

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(sender) = self.sender.lock().await.take() {
            *self.last_report.lock() = sender.report();
            sender.stop().await;
        }

        self.spool.stop().await;
        self.config.lock().take();
        info!("data service stopped");

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
            "SetConfig" => cmd.reply_result(self.set_config(cmd).await),
            "Status" => {
                let mut status = self.status();
                if let Ok(usage) = self.spool.usage().await {
                    status.insert(USAGE_FIELD.to_string(), usage_string(usage));
                }
                cmd.reply(&DataStatus {
                    status,
                    sent: self.sent_report().await,
                })
            }
            _ => cmd.reply_err(CmdError::UnknownCommand {
                service: SERVICE.to_string(),
                cmd: cmd.cmd.clone(),
            }),
        }
    }

    fn status(&self) -> BTreeMap<String, String> {
        self.ctx.status.service(SERVICE)
    }

    fn get_config(&self) -> (Vec<AgentConfigEntry>, Vec<String>) {
        let mut errs = Vec::new();

        let set = match self.ctx.basedir.read_config::<DataConfig>(SERVICE) {
            Ok(Some(cfg)) => config_string(&cfg),
            Ok(None) => String::new(),
            Err(e) => {
                errs.push(format!("{e:#}"));
                String::new()
            }
        };

        let running = self
            .config
            .lock()
            .as_ref()
            .map(config_string)
            .unwrap_or_default();

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
        self.config.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &std::path::Path) -> Manager {
        let ctx = AgentContext::for_tests(dir);
        let agent: AgentConfig = serde_json::from_str(
            r#"{"agent_uuid":"abc","api_hostname":"localhost","api_key":"k"}"#,
        )
        .expect("agent config");
        let spool = Arc::new(Spooler::new(
            ctx.basedir.data_dir(),
            ctx.basedir.trash_dir(),
            true,
            Arc::clone(&ctx.status),
            Arc::clone(&ctx.health),
        ));
        Manager::new(ctx, Arc::new(agent), spool)
    }

    #[tokio::test]
    async fn test_start_stop_with_blackhole() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let m = manager(tmp.path());
        let cfg = DataConfig {
            encoding: String::new(),
            blackhole: tmp.path().join("bh").display().to_string(),
            ..Default::default()
        };
        m.ctx.basedir.write_config(SERVICE, &cfg).expect("write");

        m.start().await.expect("start");
        assert!(m.is_running());
        assert!(!m.spool.gzip());

        let (configs, errs) = m.get_config();
        assert!(errs.is_empty());
        assert_eq!(configs[0].set, configs[0].running);

        m.stop().await.expect("stop");
        assert!(!m.is_running());
        assert!(m.get_config().0[0].running.is_empty());
    }

    #[tokio::test]
    async fn test_status_reports_spool_usage() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let m = manager(tmp.path());
        std::fs::create_dir_all(m.ctx.basedir.data_dir()).expect("mkdir");
        std::fs::write(m.ctx.basedir.data_dir().join("1"), b"abcd").expect("entry");

        let reply = m.handle(&Cmd::new(SERVICE, "Status")).await;
        assert!(!reply.is_err(), "{}", reply.error);
        let data = reply.data.expect("data");
        assert_eq!(data["status"][USAGE_FIELD], "1 files, 4 bytes");
    }

    #[tokio::test]
    async fn test_set_config_rejects_invalid() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let m = manager(tmp.path());

        let cmd = Cmd::new(SERVICE, "SetConfig").with_data(&serde_json::json!({
            "encoding": "lz4",
        }));
        let reply = m.handle(&cmd).await;
        assert!(reply.error.contains("invalid data encoding"));
        assert!(m.ctx.basedir.read_config::<DataConfig>(SERVICE).expect("read").is_none());
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let m = manager(tmp.path());
        let reply = m.handle(&Cmd::new(SERVICE, "Explode")).await;
        assert!(reply.error.contains("unknown command"));
    }
}
