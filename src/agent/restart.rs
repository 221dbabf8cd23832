//! Self-restart handover through `start.lock`.
//!
//! The running agent writes its PID to `start.lock` and spawns the binary in
//! `bin/`. The new process waits for that PID to exit before it takes over
//! the PID file, then removes the lock.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::basedir::{self, Basedir};
use crate::pid;

/// How long the replacement must stay up before the handover counts.
pub const GRACE_PERIOD: Duration = Duration::from_secs(2);

/// How long a new agent waits for its predecessor to exit.
pub const HANDOVER_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Spawn the replacement agent. On `Ok` the caller must shut down; on any
/// error the lock is gone and the caller keeps running.
pub async fn self_restart(basedir: &Basedir, grace: Duration) -> Result<()> {
    let lock = basedir.start_lock();
    if lock.exists() {
        bail!("{} exists; a restart is already in progress", lock.display());
    }

    basedir::write_private(&lock, format!("{}\n", std::process::id()).as_bytes())
        .context("creating start lock")?;

    match spawn_replacement(basedir, grace).await {
        Ok(pid) => {
            info!(pid, "replacement agent running, handing over");
            Ok(())
        }
        Err(e) => {
            remove_lock(&lock);
            Err(e)
        }
    }
}

async fn spawn_replacement(basedir: &Basedir, grace: Duration) -> Result<u32> {
    let binary = basedir.agent_binary();
    if !binary.is_file() {
        bail!("replacement binary {} not found", binary.display());
    }

    let mut child = Command::new(&binary)
        .arg("--basedir")
        .arg(basedir.root())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("starting {}", binary.display()))?;
    let pid = child.id();

    tokio::time::sleep(grace).await;

    match child.try_wait().context("checking replacement agent")? {
        Some(status) => bail!("replacement agent exited early: {status}"),
        None => Ok(pid),
    }
}

/// Called at startup. If `start.lock` exists, wait up to `timeout` for the
/// process recorded in it to exit, then remove the lock.
pub async fn wait_for_handover(basedir: &Basedir, timeout: Duration) -> Result<()> {
    let lock = basedir.start_lock();
    let Some(old) = pid::read_pid(&lock)? else {
        if lock.exists() {
            warn!(file = %lock.display(), "start lock without a PID, removing");
            remove_lock(&lock);
        }
        return Ok(());
    };

    if old != std::process::id() {
        info!(pid = old, "waiting for previous agent to exit");

        let deadline = Instant::now() + timeout;
        while pid::is_alive(old) {
            if Instant::now() >= deadline {
                bail!("previous agent (pid {old}) did not exit within {timeout:?}");
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    remove_lock(&lock);
    Ok(())
}

fn remove_lock(lock: &Path) {
    if let Err(e) = std::fs::remove_file(lock) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(file = %lock.display(), error = %e, "cannot remove start lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn basedir(root: &Path) -> Basedir {
        let dir = Basedir::new(root);
        dir.init().expect("init");
        dir
    }

    fn install(dir: &Basedir, script: &str) {
        let path = dir.agent_binary();
        std::fs::write(&path, script).expect("write binary");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    #[tokio::test]
    async fn test_missing_binary_removes_lock() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = basedir(tmp.path());

        let err = self_restart(&dir, Duration::from_millis(10))
            .await
            .expect_err("no binary");
        assert!(err.to_string().contains("not found"));
        assert!(!dir.start_lock().exists());
    }

    #[tokio::test]
    async fn test_replacement_that_dies_removes_lock() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = basedir(tmp.path());
        install(&dir, "#!/bin/sh\nexit 3\n");

        let err = self_restart(&dir, Duration::from_millis(500))
            .await
            .expect_err("replacement exits");
        assert!(err.to_string().contains("exited early"));
        assert!(!dir.start_lock().exists());
    }

    #[tokio::test]
    async fn test_running_replacement_keeps_lock() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = basedir(tmp.path());
        install(&dir, "#!/bin/sh\nsleep 2\n");

        self_restart(&dir, Duration::from_millis(200))
            .await
            .expect("restart");
        assert_eq!(
            pid::read_pid(&dir.start_lock()).expect("read"),
            Some(std::process::id())
        );
    }

    #[tokio::test]
    async fn test_concurrent_restart_refused() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = basedir(tmp.path());
        std::fs::write(dir.start_lock(), "1").expect("lock");

        let err = self_restart(&dir, Duration::from_millis(10))
            .await
            .expect_err("locked");
        assert!(err.to_string().contains("already in progress"));
        assert!(dir.start_lock().exists());
    }

    #[tokio::test]
    async fn test_handover_waits_for_previous_agent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = basedir(tmp.path());

        let mut child = Command::new("sleep").arg("0.3").spawn().expect("spawn");
        std::fs::write(dir.start_lock(), child.id().to_string()).expect("lock");

        let reaper = std::thread::spawn(move || child.wait());
        wait_for_handover(&dir, Duration::from_secs(5))
            .await
            .expect("handover");
        assert!(!dir.start_lock().exists());
        reaper.join().expect("join").expect("wait");
    }

    #[tokio::test]
    async fn test_handover_without_lock_is_noop() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = basedir(tmp.path());
        wait_for_handover(&dir, Duration::from_millis(10))
            .await
            .expect("no lock");
    }
}
