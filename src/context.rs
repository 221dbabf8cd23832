use std::sync::Arc;

use crate::basedir::Basedir;
use crate::health::HealthMetrics;
use crate::status::Status;

/// Services whose status fields exist from startup.
pub const SERVICES: &[&str] = &["agent", "log", "data", "qan", "instance", "mrms"];

/// Process-wide state shared by every subsystem: the on-disk layout, the
/// status registry and the self metrics. Built once in `main` and passed to
/// constructors.
#[derive(Clone)]
pub struct AgentContext {
    pub basedir: Basedir,
    pub status: Arc<Status>,
    pub health: Arc<HealthMetrics>,
}

impl AgentContext {
    pub fn new(basedir: Basedir, health: Arc<HealthMetrics>) -> Self {
        Self {
            basedir,
            status: Arc::new(Status::new(SERVICES)),
            health,
        }
    }

    /// Context rooted at an initialised scratch directory.
    #[cfg(test)]
    pub(crate) fn for_tests(root: &std::path::Path) -> Self {
        let basedir = Basedir::new(root);
        basedir.init().expect("init basedir");
        let health = HealthMetrics::new("").expect("health metrics");
        Self::new(basedir, Arc::new(health))
    }
}
