use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::analyzer::{Analyzer, AnalyzerDeps};
use super::config::QanConfig;
use crate::instance::Repo;
use crate::mysql::redact;
use crate::proto::{AgentConfigEntry, Cmd, CmdError, Reply};
use crate::service::{config_string, ServiceManager};

const SERVICE: &str = "qan";
const CONFIG_PREFIX: &str = "qan-";

/// Payload of `StopService`.
#[derive(Debug, Deserialize)]
struct StopAnalyzer {
    uuid: String,
}

fn config_name(uuid: &str) -> String {
    format!("{CONFIG_PREFIX}{uuid}")
}

/// The `qan` service: one analyzer per MySQL instance.
pub struct Manager {
    deps: AnalyzerDeps,
    repo: Arc<Repo>,
    analyzers: parking_lot::Mutex<HashMap<String, Arc<Analyzer>>>,
    running: AtomicBool,
    listener: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Manager {
    pub fn new(deps: AnalyzerDeps, repo: Arc<Repo>) -> Self {
        Self {
            deps,
            repo,
            analyzers: parking_lot::Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            listener: parking_lot::Mutex::new(None),
        }
    }

    /// The running analyzer of instance `uuid`.
    pub fn analyzer(&self, uuid: &str) -> Option<Arc<Analyzer>> {
        self.analyzers.lock().get(uuid).cloned()
    }

    fn start_analyzer(&self, config: QanConfig) -> Result<()> {
        config.validate()?;

        let instance = self
            .repo
            .get(&config.uuid)
            .with_context(|| format!("unknown instance {}", config.uuid))?;
        if instance.dsn.is_empty() {
            bail!("instance {} has no dsn", config.uuid);
        }

        let mut analyzers = self.analyzers.lock();
        if analyzers.contains_key(&config.uuid) {
            bail!(CmdError::ServiceIsRunning(config_name(&config.uuid)));
        }

        info!(uuid = %config.uuid, dsn = %redact(&instance.dsn), "starting qan analyzer");
        let uuid = config.uuid.clone();
        let analyzer = Analyzer::start(config, &instance.dsn, self.deps.clone());
        analyzers.insert(uuid, Arc::new(analyzer));

        Ok(())
    }

    fn start_service(&self, cmd: &Cmd) -> Result<()> {
        if !self.is_running() {
            bail!(CmdError::ServiceIsNotRunning(SERVICE.to_string()));
        }

        let config: QanConfig = cmd.payload()?;
        self.start_analyzer(config.clone())?;

        self.deps
            .ctx
            .basedir
            .write_config(&config_name(&config.uuid), &config)
            .context("saving qan config")
    }

    async fn stop_service(&self, cmd: &Cmd) -> Result<()> {
        let req: StopAnalyzer = cmd.payload()?;

        let analyzer = self
            .analyzers
            .lock()
            .remove(&req.uuid)
            .ok_or_else(|| CmdError::ServiceIsNotRunning(config_name(&req.uuid)))?;

        analyzer.stop().await;
        self.forget(&req.uuid);

        self.deps
            .ctx
            .basedir
            .remove_config(&config_name(&req.uuid))
    }

    /// Drop the status fields of a stopped analyzer.
    fn forget(&self, uuid: &str) {
        let status = &self.deps.ctx.status;
        for field in ["", "-error", "-last-interval"] {
            status.remove(SERVICE, &format!("qan-analyzer-{uuid}{field}"));
        }
        status.remove(SERVICE, &format!("qan-worker-{uuid}"));
    }

    fn start_restart_listener(&self) {
        let mut rx = self.deps.mrms.global_subscribe();
        let status = Arc::clone(&self.deps.ctx.status);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    dsn = rx.recv() => match dsn {
                        Some(dsn) => status.update(
                            SERVICE,
                            "qan-last-mysql-restart",
                            format!("{} at {}", redact(&dsn), chrono::Utc::now().to_rfc3339()),
                        ),
                        None => break,
                    },
                }
            }
        });

        if let Some((old, _)) = self.listener.lock().replace((cancel, handle)) {
            old.cancel();
        }
    }
}

impl ServiceManager for Manager {
    fn name(&self) -> &'static str {
        SERVICE
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.start_restart_listener();

        let basedir = &self.deps.ctx.basedir;
        for name in basedir.list_configs(CONFIG_PREFIX)? {
            let config = match basedir.read_config::<QanConfig>(&name) {
                Ok(Some(config)) => config,
                Ok(None) => continue,
                Err(e) => {
                    warn!(config = %name, error = %format!("{e:#}"), "skipping invalid qan config");
                    continue;
                }
            };

            if let Err(e) = self.start_analyzer(config) {
                warn!(config = %name, error = %format!("{e:#}"), "cannot start qan analyzer");
            }
        }

        self.deps.ctx.status.update(SERVICE, "qan", "Running");
        info!(analyzers = self.analyzers.lock().len(), "qan service started");

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let analyzers: Vec<(String, Arc<Analyzer>)> = self.analyzers.lock().drain().collect();
        for (uuid, analyzer) in analyzers {
            analyzer.stop().await;
            self.forget(&uuid);
        }

        let listener = self.listener.lock().take();
        if let Some((cancel, handle)) = listener {
            cancel.cancel();
            let _ = handle.await;
        }

        self.running.store(false, Ordering::SeqCst);
        self.deps.ctx.status.update(SERVICE, "qan", "Stopped");
        info!("qan service stopped");

        Ok(())
    }

    async fn handle(&self, cmd: &Cmd) -> Reply {
        match cmd.cmd.as_str() {
            "StartService" => match self.start_service(cmd) {
                Ok(()) => cmd.reply_ok(),
                Err(e) => cmd.reply_err(format!("{e:#}")),
            },
            "StopService" => match self.stop_service(cmd).await {
                Ok(()) => cmd.reply_ok(),
                Err(e) => cmd.reply_err(format!("{e:#}")),
            },
            "GetConfig" => {
                let (configs, errs) = self.get_config();
                if errs.is_empty() {
                    cmd.reply(&configs)
                } else {
                    cmd.reply_err(errs.join("; "))
                }
            }
            "Status" => cmd.reply(&self.status()),
            _ => cmd.reply_err(CmdError::UnknownCommand {
                service: SERVICE.to_string(),
                cmd: cmd.cmd.clone(),
            }),
        }
    }

    fn status(&self) -> BTreeMap<String, String> {
        let mut status = self.deps.ctx.status.service(SERVICE);
        for (uuid, analyzer) in self.analyzers.lock().iter() {
            status.insert(format!("qan-analyzer-{uuid}"), analyzer.state().to_string());
        }
        status
    }

    fn get_config(&self) -> (Vec<AgentConfigEntry>, Vec<String>) {
        let basedir = &self.deps.ctx.basedir;
        let mut entries = Vec::new();
        let mut errs = Vec::new();

        let names = match basedir.list_configs(CONFIG_PREFIX) {
            Ok(names) => names,
            Err(e) => {
                errs.push(format!("{e:#}"));
                Vec::new()
            }
        };

        let analyzers = self.analyzers.lock();
        for name in names {
            let uuid = name.trim_start_matches(CONFIG_PREFIX).to_string();

            let set = match basedir.read_config::<QanConfig>(&name) {
                Ok(Some(cfg)) => config_string(&cfg),
                Ok(None) => String::new(),
                Err(e) => {
                    errs.push(format!("{name}: {e:#}"));
                    String::new()
                }
            };

            let running = analyzers
                .get(&uuid)
                .map(|a| config_string(a.config()))
                .unwrap_or_default();

            entries.push(AgentConfigEntry {
                service: SERVICE.to_string(),
                uuid,
                set,
                running,
            });
        }

        (entries, errs)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
