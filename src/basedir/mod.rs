use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Environment variable naming the default basedir.
pub const BASEDIR_ENV: &str = "PERCONA_AGENT_DIR";

/// Default basedir when neither the flag nor the environment set one.
pub const DEFAULT_BASEDIR: &str = "/usr/local/percona/agent";

pub const CONFIG_DIR: &str = "config";
pub const DATA_DIR: &str = "data";
pub const BIN_DIR: &str = "bin";
pub const TRASH_DIR: &str = "trash";
pub const START_LOCK_FILE: &str = "start.lock";
pub const DEFAULT_PID_FILE: &str = "percona-agent.pid";

/// Binary name inside `bin/` used for restarts.
pub const AGENT_BINARY: &str = "percona-agent";

const CONFIG_DIR_MODE: u32 = 0o700;
const CONFIG_FILE_MODE: u32 = 0o600;

/// Resolved on-disk layout of one agent installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Basedir {
    root: PathBuf,
}

impl Basedir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory tree. The config dir is restricted to the owner.
    pub fn init(&self) -> Result<()> {
        for dir in [DATA_DIR, BIN_DIR, TRASH_DIR] {
            let path = self.root.join(dir);
            fs::create_dir_all(&path)
                .with_context(|| format!("creating {}", path.display()))?;
        }

        let config = self.config_dir();
        fs::create_dir_all(&config)
            .with_context(|| format!("creating {}", config.display()))?;
        fs::set_permissions(&config, fs::Permissions::from_mode(CONFIG_DIR_MODE))
            .with_context(|| format!("setting permissions on {}", config.display()))?;

        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join(CONFIG_DIR)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join(BIN_DIR)
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.root.join(TRASH_DIR)
    }

    pub fn start_lock(&self) -> PathBuf {
        self.root.join(START_LOCK_FILE)
    }

    pub fn agent_binary(&self) -> PathBuf {
        self.bin_dir().join(AGENT_BINARY)
    }

    /// Path of a config file, e.g. `config_file("agent")` → `config/agent.conf`.
    pub fn config_file(&self, service: &str) -> PathBuf {
        self.config_dir().join(format!("{service}.conf"))
    }

    /// Read and decode a JSON config file. `Ok(None)` when it does not exist.
    pub fn read_config<T: DeserializeOwned>(&self, service: &str) -> Result<Option<T>> {
        read_json(&self.config_file(service))
    }

    /// Encode and atomically write a JSON config file with mode 0600.
    pub fn write_config<T: Serialize>(&self, service: &str, value: &T) -> Result<()> {
        write_json(&self.config_file(service), value)
    }

    /// Remove a config file; missing files are not an error.
    pub fn remove_config(&self, service: &str) -> Result<()> {
        let path = self.config_file(service);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    /// Names (without extension) of config files starting with `prefix`.
    pub fn list_configs(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.config_dir();
        let mut names = Vec::new();

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e).with_context(|| format!("reading {}", dir.display())),
        };

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(".conf") {
                if stem.starts_with(prefix) {
                    names.push(stem.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }
}

/// Read a JSON document. `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    let value = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing {}", path.display()))?;

    Ok(Some(value))
}

/// Write a JSON document via a temp file and rename, mode 0600.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).context("encoding config")?;
    write_private(path, &data)
}

/// Atomically write `data` to `path` with mode 0600.
pub fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");

    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(CONFIG_FILE_MODE)
            .open(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(data)
            .with_context(|| format!("writing {}", tmp.display()))?;
        file.sync_all().ok();
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;

    Ok(())
}
