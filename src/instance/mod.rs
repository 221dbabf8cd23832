//! Instance repository: the tree of monitored systems, rooted at the OS.

pub mod manager;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use manager::Manager;

use crate::basedir::{read_json, write_json, Basedir};

/// File name of the persisted tree under the config dir.
pub const SYSTEM_TREE_FILE: &str = "system-tree.json";

pub const TYPE_OS: &str = "OS";
pub const TYPE_MYSQL: &str = "MySQL";

/// One monitored system and the systems running on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub prefix: String,
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    /// Connection string, for MySQL instances.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dsn: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsystems: Vec<Instance>,
}

/// The versioned tree as exchanged with the management service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemTree {
    pub version: u64,
    pub tree: Instance,
}

impl Instance {
    /// Depth-first search by UUID.
    pub fn find(&self, uuid: &str) -> Option<&Instance> {
        if self.uuid == uuid {
            return Some(self);
        }
        self.subsystems.iter().find_map(|s| s.find(uuid))
    }

    fn collect_uuids<'a>(&'a self, seen: &mut HashSet<&'a str>) -> Result<()> {
        if self.uuid.is_empty() {
            bail!("{} instance {:?} has no uuid", self.kind, self.name);
        }
        if !seen.insert(self.uuid.as_str()) {
            bail!("duplicate instance uuid {}", self.uuid);
        }
        for sub in &self.subsystems {
            sub.collect_uuids(seen)?;
        }
        Ok(())
    }
}

impl SystemTree {
    pub fn validate(&self) -> Result<()> {
        if self.tree.kind != TYPE_OS {
            bail!("system tree root must be {TYPE_OS}, got {:?}", self.tree.kind);
        }

        let mut seen = HashSet::new();
        self.tree.collect_uuids(&mut seen)
    }
}

/// In-memory system tree backed by `config/system-tree.json`.
pub struct Repo {
    path: PathBuf,
    tree: parking_lot::RwLock<Option<SystemTree>>,
}

impl Repo {
    pub fn new(basedir: &Basedir) -> Self {
        Self {
            path: basedir.config_dir().join(SYSTEM_TREE_FILE),
            tree: parking_lot::RwLock::new(None),
        }
    }

    /// Load the persisted tree, if any.
    pub fn init(&self) -> Result<()> {
        let Some(tree) = read_json::<SystemTree>(&self.path)? else {
            info!("no system tree yet");
            return Ok(());
        };

        tree.validate()
            .with_context(|| format!("invalid {}", self.path.display()))?;
        info!(version = tree.version, "system tree loaded");
        *self.tree.write() = Some(tree);

        Ok(())
    }

    pub fn tree(&self) -> Option<SystemTree> {
        self.tree.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.tree.read().as_ref().map(|t| t.version).unwrap_or(0)
    }

    /// Replace the tree with a newer version and persist it.
    pub fn update(&self, tree: SystemTree) -> Result<()> {
        tree.validate()?;

        let mut current = self.tree.write();
        if let Some(cur) = current.as_ref() {
            if tree.version <= cur.version {
                bail!(
                    "system tree version {} is not newer than {}",
                    tree.version,
                    cur.version
                );
            }
        }

        write_json(&self.path, &tree).context("saving system tree")?;
        info!(version = tree.version, "system tree updated");
        *current = Some(tree);

        Ok(())
    }

    /// A copy of the instance with `uuid`, including its subsystems.
    pub fn get(&self, uuid: &str) -> Option<Instance> {
        self.tree
            .read()
            .as_ref()
            .and_then(|t| t.tree.find(uuid).cloned())
    }
}
