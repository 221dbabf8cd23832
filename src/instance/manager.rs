use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::{Repo, SystemTree};
use crate::context::AgentContext;
use crate::proto::{AgentConfigEntry, Cmd, CmdError, Reply};
use crate::service::{config_string, ServiceManager};

const SERVICE: &str = "instance";

/// Payload of `Get`.
#[derive(Debug, Deserialize)]
struct GetInstance {
    uuid: String,
}

/// The `instance` service: read and replace the system tree.
pub struct Manager {
    ctx: AgentContext,
    repo: Arc<Repo>,
    running: AtomicBool,
}

impl Manager {
    pub fn new(ctx: AgentContext, repo: Arc<Repo>) -> Self {
        Self {
            ctx,
            repo,
            running: AtomicBool::new(false),
        }
    }

    pub fn repo(&self) -> Arc<Repo> {
        Arc::clone(&self.repo)
    }

    fn update_tree(&self, cmd: &Cmd) -> Result<SystemTree> {
        let tree: SystemTree = cmd.payload()?;
        self.repo.update(tree.clone())?;
        self.set_status();
        Ok(tree)
    }

    fn get(&self, cmd: &Cmd) -> Result<super::Instance> {
        let req: GetInstance = cmd.payload()?;
        self.repo
            .get(&req.uuid)
            .with_context(|| format!("instance {} not found", req.uuid))
    }

    fn set_status(&self) {
        self.ctx.status.update(
            SERVICE,
            "instance-repo",
            format!("system tree version {}", self.repo.version()),
        );
    }
}

impl ServiceManager for Manager {
    fn name(&self) -> &'static str {
        SERVICE
    }

    async fn start(&self) -> Result<()> {
        self.repo.init()?;
        self.running.store(true, Ordering::SeqCst);
        self.set_status();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn handle(&self, cmd: &Cmd) -> Reply {
        match cmd.cmd.as_str() {
            "GetSystemTree" => match self.repo.tree() {
                Some(tree) => cmd.reply(&tree),
                None => cmd.reply_err("no system tree"),
            },
            "UpdateSystemTree" => cmd.reply_result(self.update_tree(cmd)),
            "Get" => cmd.reply_result(self.get(cmd)),
            "GetConfig" => cmd.reply(&self.get_config().0),
            "Status" => cmd.reply(&self.status()),
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
        let tree = self.repo.tree().map(|t| config_string(&t)).unwrap_or_default();
        (
            vec![AgentConfigEntry {
                service: SERVICE.to_string(),
                set: tree.clone(),
                running: tree,
                ..Default::default()
            }],
            Vec::new(),
        )
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::tests::tree;

    fn manager(dir: &std::path::Path) -> Manager {
        let ctx = AgentContext::for_tests(dir);
        let repo = Arc::new(Repo::new(&ctx.basedir));
        Manager::new(ctx, repo)
    }

    #[tokio::test]
    async fn test_system_tree_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let m = manager(tmp.path());
        m.start().await.expect("start");

        let reply = m.handle(&Cmd::new(SERVICE, "GetSystemTree")).await;
        assert!(reply.is_err());

        let original = tree(1, "mysql://root@localhost/");
        let update = Cmd::new(SERVICE, "UpdateSystemTree").with_data(&original);
        let reply = m.handle(&update).await;
        assert!(!reply.is_err(), "{}", reply.error);

        let reply = m.handle(&Cmd::new(SERVICE, "GetSystemTree")).await;
        let read: SystemTree =
            serde_json::from_value(reply.data.expect("tree")).expect("decode");
        assert_eq!(read, original);

        // Writing back what was read needs a newer version.
        let again = m
            .handle(&Cmd::new(SERVICE, "UpdateSystemTree").with_data(&read))
            .await;
        assert!(again.error.contains("not newer"));

        let mut newer = read.clone();
        newer.version = 2;
        let reply = m
            .handle(&Cmd::new(SERVICE, "UpdateSystemTree").with_data(&newer))
            .await;
        assert!(!reply.is_err(), "{}", reply.error);
        assert_eq!(m.repo.tree(), Some(newer));
    }

    #[tokio::test]
    async fn test_get_instance() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let m = manager(tmp.path());
        m.repo.update(tree(1, "mysql://root@db/")).expect("update");

        let cmd = Cmd::new(SERVICE, "Get").with_data(&serde_json::json!({"uuid": "mysql-1"}));
        let reply = m.handle(&cmd).await;
        assert_eq!(reply.data.expect("instance")["dsn"], "mysql://root@db/");

        let cmd = Cmd::new(SERVICE, "Get").with_data(&serde_json::json!({"uuid": "x"}));
        assert!(m.handle(&cmd).await.error.contains("not found"));
    }
}
