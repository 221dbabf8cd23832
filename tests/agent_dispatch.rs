use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use percona_agent::agent::{Agent, CmdLink};
use percona_agent::basedir::Basedir;
use percona_agent::client::MockLink;
use percona_agent::config::{AgentConfig, LogConfig};
use percona_agent::context::AgentContext;
use percona_agent::health::HealthMetrics;
use percona_agent::instance::{Instance, Repo, SystemTree};
use percona_agent::logrelay::Relay;
use percona_agent::mrms::Monitor;
use percona_agent::mysql::MockConnectionFactory;
use percona_agent::proto::{Cmd, Reply};
use percona_agent::qan::{AnalyzerDeps, CollectFrom, QanConfig};
use percona_agent::service::Manager;
use percona_agent::spool::Spooler;
use percona_agent::ticker::Clock;
use percona_agent::{instance, logrelay, qan};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DSN: &str = "mysql://root@localhost:3306/";
const ORDER: &[&str] = &["log", "instance", "qan"];

struct Harness {
    agent: Arc<Agent>,
    ctx: AgentContext,
    inject: mpsc::Sender<Cmd>,
    sent: mpsc::Receiver<Reply>,
    cancel: CancellationToken,
    _tmp: tempfile::TempDir,
}

async fn harness() -> Harness {
    let tmp = tempfile::tempdir().expect("tempdir");
    let basedir = Basedir::new(tmp.path());
    basedir.init().expect("init");
    let health = Arc::new(HealthMetrics::new("").expect("metrics"));
    let ctx = AgentContext::new(basedir.clone(), Arc::clone(&health));

    let factory = Arc::new(MockConnectionFactory::new());
    let spool = Arc::new(Spooler::new(
        basedir.data_dir(),
        basedir.trash_dir(),
        false,
        Arc::clone(&ctx.status),
        health,
    ));
    spool.start().expect("spool");
    let repo = Arc::new(Repo::new(&basedir));
    let deps = AnalyzerDeps {
        ctx: ctx.clone(),
        clock: Arc::new(Clock::new()),
        spool,
        mrms: Arc::new(Monitor::new(ctx.clone(), factory.clone(), Duration::from_secs(1))),
        factory,
    };

    let relay = Arc::new(Relay::new(ctx.clone(), None, LogConfig::default()));
    let services = vec![
        Manager::Log(logrelay::Manager::new(ctx.clone(), relay, None)),
        Manager::Instance(instance::Manager::new(ctx.clone(), Arc::clone(&repo))),
        Manager::Qan(qan::Manager::new(deps, repo)),
    ];

    let config: AgentConfig = serde_json::from_str(
        r#"{"agent_uuid":"agent-1","api_hostname":"localhost","api_key":"k"}"#,
    )
    .expect("config");
    let link: Arc<MockLink<Cmd, Reply>> = Arc::new(MockLink::new());
    let inject = link.injector();
    let sent = link.sent().expect("sent");

    let agent = Arc::new(Agent::new(ctx.clone(), config, link as Arc<CmdLink>, services));
    agent.start_services(ORDER).await;

    let cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&agent).run(cancel.clone()));

    Harness {
        agent,
        ctx,
        inject,
        sent,
        cancel,
        _tmp: tmp,
    }
}

impl Harness {
    async fn send(&mut self, cmd: Cmd) -> Reply {
        self.inject.send(cmd.clone()).await.expect("inject");
        let reply = tokio::time::timeout(Duration::from_secs(10), self.sent.recv())
            .await
            .expect("reply in time")
            .expect("reply");
        assert_eq!(reply.id, cmd.id);
        reply
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.agent.stop_services(ORDER).await;
    }
}

fn system_tree() -> SystemTree {
    SystemTree {
        version: 1,
        tree: Instance {
            kind: instance::TYPE_OS.to_string(),
            uuid: "os-1".into(),
            name: "db01".into(),
            subsystems: vec![Instance {
                kind: instance::TYPE_MYSQL.to_string(),
                uuid: "mysql-1".into(),
                name: "db01".into(),
                dsn: DSN.into(),
                ..Default::default()
            }],
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn test_every_command_gets_exactly_one_reply() {
    let mut h = harness().await;

    let cmds: Vec<Cmd> = (0..30)
        .map(|n| match n % 3 {
            0 => Cmd::new("agent", "Ping"),
            1 => Cmd::new("agent", "Status"),
            _ => Cmd::new("nowhere", "Status"),
        })
        .collect();
    for cmd in &cmds {
        h.inject.send(cmd.clone()).await.expect("inject");
    }

    let mut ids = HashSet::new();
    for _ in 0..cmds.len() {
        let reply = tokio::time::timeout(Duration::from_secs(10), h.sent.recv())
            .await
            .expect("reply in time")
            .expect("reply");
        assert!(ids.insert(reply.id), "duplicate reply");
    }

    let expected: HashSet<String> = cmds.iter().map(|c| c.id.clone()).collect();
    assert_eq!(ids, expected);
    assert!(tokio::time::timeout(Duration::from_millis(200), h.sent.recv())
        .await
        .is_err());

    h.stop().await;
}

#[tokio::test]
async fn test_qan_lifecycle_through_dispatcher() {
    let mut h = harness().await;

    let reply = h
        .send(Cmd::new("instance", "UpdateSystemTree").with_data(&system_tree()))
        .await;
    assert!(!reply.is_err(), "{}", reply.error);

    let config = QanConfig::new("mysql-1", CollectFrom::Perfschema);
    let reply = h
        .send(Cmd::new("qan", "StartService").with_data(&config))
        .await;
    assert!(!reply.is_err(), "{}", reply.error);
    assert!(h.ctx.basedir.config_file("qan-mysql-1").exists());

    let reply = h
        .send(Cmd::new("qan", "StartService").with_data(&config))
        .await;
    assert!(reply.error.contains("already running"), "{}", reply.error);

    let mut state = None;
    for _ in 0..100 {
        let reply = h.send(Cmd::new("agent", "Status")).await;
        let status: BTreeMap<String, String> =
            serde_json::from_value(reply.data.expect("data")).expect("status");
        state = status.get("qan-analyzer-mysql-1").cloned();
        if state.as_deref() == Some("Idle") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.as_deref(), Some("Idle"));

    let reply = h
        .send(Cmd::new("qan", "StopService").with_data(&serde_json::json!({"uuid": "mysql-1"})))
        .await;
    assert!(!reply.is_err(), "{}", reply.error);
    assert!(!h.ctx.basedir.config_file("qan-mysql-1").exists());
    assert!(h.ctx.status.get("qan", "qan-analyzer-mysql-1").is_none());

    let reply = h
        .send(Cmd::new("qan", "StartService").with_data(&QanConfig::new(
            "mysql-9",
            CollectFrom::Perfschema,
        )))
        .await;
    assert!(reply.error.contains("unknown instance mysql-9"), "{}", reply.error);

    h.stop().await;
}
