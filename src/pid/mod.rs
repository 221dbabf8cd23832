//! PID file ownership.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

/// A PID file held by this process until [`PidFile::release`].
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write our PID to `path`.
    ///
    /// Fails if the file names a live process other than ourselves. A file
    /// with a dead or unparsable PID is stale and overwritten.
    pub fn acquire(path: &Path) -> Result<Self> {
        let own = std::process::id();

        if let Some(pid) = read_pid(path)? {
            if pid != own && is_alive(pid) {
                bail!(
                    "PID file {} names running process {pid}; another agent is running",
                    path.display()
                );
            }
            if pid != own {
                warn!(pid, file = %path.display(), "removing stale PID file");
            }
        }

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
        }

        let tmp = path.with_extension("pid.tmp");
        fs::write(&tmp, format!("{own}\n"))
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;

        debug!(pid = own, file = %path.display(), "PID file written");

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file if it still names us.
    pub fn release(self) -> Result<()> {
        match read_pid(&self.path)? {
            Some(pid) if pid == std::process::id() => fs::remove_file(&self.path)
                .with_context(|| format!("removing {}", self.path.display())),
            Some(pid) => {
                warn!(pid, file = %self.path.display(), "PID file taken over, leaving it");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// PID recorded in `path`. `Ok(None)` if the file is missing or garbage.
pub fn read_pid(path: &Path) -> Result<Option<u32>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    Ok(raw.trim().parse().ok().filter(|pid| *pid > 0))
}

/// Whether a process with `pid` exists. A process owned by another user
/// counts as alive.
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // SAFETY: signal 0 only checks that the target exists.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }

    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Above the kernel's pid_max, so never a live process.
    const DEAD_PID: u32 = 4_194_304 + 17;

    #[test]
    fn test_acquire_writes_own_pid() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("run/agent.pid");

        let pid = PidFile::acquire(&path).expect("acquire");
        assert_eq!(
            read_pid(&path).expect("read"),
            Some(std::process::id())
        );

        pid.release().expect("release");
        assert!(!path.exists());
    }

    #[test]
    fn test_acquire_refuses_live_process() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("agent.pid");

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        fs::write(&path, child.id().to_string()).expect("write");

        let err = PidFile::acquire(&path).expect_err("live owner");
        assert!(err.to_string().contains("another agent is running"));

        child.kill().expect("kill");
        child.wait().expect("wait");
    }

    #[test]
    fn test_stale_and_garbage_files_are_replaced() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("agent.pid");

        fs::write(&path, DEAD_PID.to_string()).expect("write");
        PidFile::acquire(&path).expect("stale pid");

        fs::write(&path, "not a pid").expect("write");
        PidFile::acquire(&path).expect("garbage");
        assert_eq!(
            read_pid(&path).expect("read"),
            Some(std::process::id())
        );
    }

    #[test]
    fn test_release_leaves_foreign_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("agent.pid");

        let pid = PidFile::acquire(&path).expect("acquire");
        fs::write(&path, DEAD_PID.to_string()).expect("overwrite");
        pid.release().expect("release");
        assert!(path.exists());
    }

    #[test]
    fn test_is_alive() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(DEAD_PID));
        assert!(!is_alive(0));
    }
}
