use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::de::IgnoredAny;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use percona_agent::agent::{restart, Agent, CmdLink};
use percona_agent::basedir::{Basedir, BASEDIR_ENV, DEFAULT_BASEDIR};
use percona_agent::client::{ApiClient, Link, WebsocketLink};
use percona_agent::config::{AgentConfig, DataConfig, LogConfig};
use percona_agent::context::AgentContext;
use percona_agent::health::HealthMetrics;
use percona_agent::instance::Repo;
use percona_agent::logrelay::{LogLink, Relay, RelayLayer};
use percona_agent::mrms::{self, Monitor};
use percona_agent::mysql::SqlxConnectionFactory;
use percona_agent::pid::PidFile;
use percona_agent::proto::{Cmd, LogEntry, Reply};
use percona_agent::qan::AnalyzerDeps;
use percona_agent::service::Manager;
use percona_agent::spool::Spooler;
use percona_agent::ticker::Clock;
use percona_agent::{instance, logrelay, qan, spool, version};

/// Services in start order; they stop in reverse, so the log relay goes last.
const SERVICE_ORDER: &[&str] = &["log", "data", "instance", "qan"];

const API_TIMEOUT: Duration = Duration::from_secs(10);

/// MySQL monitoring agent.
#[derive(Parser)]
#[command(name = "percona-agent", about)]
struct Cli {
    /// Agent installation directory.
    #[arg(long, env = BASEDIR_ENV, default_value = DEFAULT_BASEDIR)]
    basedir: PathBuf,

    /// PID file; overrides `pid_file` of agent.conf.
    #[arg(long)]
    pidfile: Option<PathBuf>,

    /// Ping the API and exit.
    #[arg(long)]
    ping: bool,

    /// Print the agent status known to the API and exit.
    #[arg(long)]
    status: bool,

    /// Print version information and exit.
    #[arg(long)]
    version: bool,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("percona-agent {}", version::full());
        return Ok(());
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cli))
}

fn init_tracing(level: &str, relay: Option<RelayLayer>) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(relay)
        .try_init()
        .context("installing tracing subscriber")
}

async fn run(cli: Cli) -> Result<()> {
    // 1. Basedir and agent config. Failures here are fatal.
    let basedir = Basedir::new(&cli.basedir);
    basedir
        .init()
        .with_context(|| format!("setting up basedir {}", cli.basedir.display()))?;

    let cfg = AgentConfig::load(&basedir.config_file("agent"))?;

    if cli.ping || cli.status {
        init_tracing(&cli.log_level, None)?;
        return query_api(&cfg, cli.ping).await;
    }

    // 2. Wait for a restarting predecessor, then take the PID file.
    restart::wait_for_handover(&basedir, restart::HANDOVER_TIMEOUT).await?;

    let pid_path = cli
        .pidfile
        .clone()
        .unwrap_or_else(|| resolve(basedir.root(), &cfg.pid_file));
    let pid_file = PidFile::acquire(&pid_path)?;

    let health = Arc::new(HealthMetrics::new(&cfg.health_addr).context("creating health metrics")?);
    let ctx = AgentContext::new(basedir.clone(), Arc::clone(&health));

    // 3. Log relay, then tracing so everything after this is relayed.
    let log_cfg: LogConfig = basedir.read_config("log")?.unwrap_or_default();
    let log_link: Arc<LogLink> = Arc::new(WebsocketLink::<IgnoredAny, LogEntry>::send_only(
        "log",
        "log",
        cfg.link("log")?,
        &cfg.api_key,
        ctx.clone(),
    ));
    let relay = Arc::new(Relay::new(ctx.clone(), Some(Arc::clone(&log_link)), log_cfg));
    init_tracing(
        &cli.log_level,
        Some(RelayLayer::new(relay.sender()).with_health(Arc::clone(&health))),
    )?;

    info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        basedir = %basedir.root().display(),
        pid_file = %pid_file.path().display(),
        "starting percona-agent",
    );

    // 4. Data spool.
    let data_cfg: DataConfig = basedir.read_config("data")?.unwrap_or_default();
    let spooler = Arc::new(Spooler::new(
        basedir.data_dir(),
        basedir.trash_dir(),
        data_cfg.gzip(),
        Arc::clone(&ctx.status),
        Arc::clone(&health),
    ));
    let agent_cfg = Arc::new(cfg.clone());

    // 5. Shared QAN plumbing: restart monitor, tick clock, instance repo.
    let factory = Arc::new(SqlxConnectionFactory);
    let monitor = Arc::new(Monitor::new(ctx.clone(), factory.clone(), mrms::DEFAULT_INTERVAL));
    monitor.start();
    let clock = Arc::new(Clock::new());
    let repo = Arc::new(Repo::new(&basedir));

    let deps = AnalyzerDeps {
        ctx: ctx.clone(),
        clock: Arc::clone(&clock),
        spool: Arc::clone(&spooler),
        mrms: Arc::clone(&monitor),
        factory,
    };

    let services = vec![
        Manager::Log(logrelay::Manager::new(
            ctx.clone(),
            Arc::clone(&relay),
            Some(Arc::clone(&log_link)),
        )),
        Manager::Data(spool::Manager::new(ctx.clone(), agent_cfg, spooler)),
        Manager::Instance(instance::Manager::new(ctx.clone(), Arc::clone(&repo))),
        Manager::Qan(qan::Manager::new(deps, repo)),
    ];

    // 6. Control link and dispatcher.
    let cmd_link: Arc<CmdLink> = Arc::new(
        WebsocketLink::<Cmd, Reply>::new("cmd", "agent", cfg.link("cmd")?, &cfg.api_key, ctx.clone())
            .with_keepalive(cfg.keepalive),
    );
    let agent = Arc::new(Agent::new(ctx.clone(), cfg, Arc::clone(&cmd_link), services));

    if let Err(e) = health.start().await {
        error!(error = %format!("{e:#}"), "cannot start health metrics server");
    }

    agent.start_services(SERVICE_ORDER).await;

    let cancel = CancellationToken::new();
    let mut agent_task = tokio::spawn(Arc::clone(&agent).run(cancel.clone()));

    // 7. Signals.
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("registering SIGHUP handler")?;
    let mut sigusr1 =
        signal(SignalKind::user_defined1()).context("registering SIGUSR1 handler")?;
    let handed_over = agent.shutdown_token();

    let mut agent_done = false;
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = handed_over.cancelled() => break,
            _ = sighup.recv() => {
                info!("received SIGHUP, reconnecting control link");
                cmd_link.reconnect();
            }
            _ = sigusr1.recv() => print_status(&agent),
            res = &mut agent_task => {
                agent_done = true;
                match res {
                    Ok(Ok(())) => warn!("dispatcher stopped"),
                    Ok(Err(e)) => error!(error = %format!("{e:#}"), "dispatcher failed"),
                    Err(e) => error!(critical = true, error = %e, "dispatcher crashed"),
                }
                break;
            }
        }
    }

    // 8. Graceful shutdown.
    cancel.cancel();
    if !agent_done {
        if let Err(e) = agent_task.await {
            error!(error = %e, "dispatcher crashed during shutdown");
        }
    }

    agent.stop_services(SERVICE_ORDER).await;
    monitor.stop().await;
    clock.stop();
    health.stop();
    log_link.disconnect();

    if let Err(e) = pid_file.release() {
        warn!(error = %format!("{e:#}"), "cannot remove PID file");
    }

    info!("percona-agent stopped");

    Ok(())
}

/// `--ping` / `--status`.
async fn query_api(cfg: &AgentConfig, ping: bool) -> Result<()> {
    let api = ApiClient::new(cfg, API_TIMEOUT)?;

    if ping {
        let latency = api.ping().await?;
        println!("Ping OK ({latency:?})");
        return Ok(());
    }

    let status = api.agent_status(&cfg.agent_uuid).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&status).context("encoding status")?
    );
    Ok(())
}

fn print_status(agent: &Agent) {
    match serde_json::to_string_pretty(&agent.status()) {
        Ok(status) => println!("{status}"),
        Err(e) => warn!(error = %e, "cannot encode status"),
    }
}

fn resolve(root: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
