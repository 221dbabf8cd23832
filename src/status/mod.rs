use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::proto::Cmd;

type Fields = Arc<RwLock<BTreeMap<String, String>>>;

/// Process-wide registry of human-readable status strings.
///
/// Each service owns its own lock, so a subsystem updating its fields only
/// contends with readers of that same service. The outer lock is taken for
/// writing only when a service is seen for the first time.
#[derive(Debug, Default)]
pub struct Status {
    services: RwLock<HashMap<String, Fields>>,
}

impl Status {
    pub fn new(services: &[&str]) -> Self {
        let map = services
            .iter()
            .map(|s| ((*s).to_string(), Fields::default()))
            .collect();

        Self {
            services: RwLock::new(map),
        }
    }

    fn entry(&self, service: &str) -> Fields {
        if let Some(fields) = self.services.read().get(service) {
            return Arc::clone(fields);
        }

        let mut services = self.services.write();
        Arc::clone(services.entry(service.to_string()).or_default())
    }

    /// Set `field` of `service` to `value`.
    pub fn update(&self, service: &str, field: &str, value: impl Into<String>) {
        let fields = self.entry(service);
        fields.write().insert(field.to_string(), value.into());
    }

    /// Set `field` and append the command the status refers to.
    pub fn update_re(&self, service: &str, field: &str, value: &str, cmd: &Cmd) {
        self.update(service, field, format!("{value} {cmd}"));
    }

    pub fn get(&self, service: &str, field: &str) -> Option<String> {
        let fields = self.services.read().get(service).map(Arc::clone)?;
        let value = fields.read().get(field).cloned();
        value
    }

    /// Remove one field, e.g. when a per-instance analyzer goes away.
    pub fn remove(&self, service: &str, field: &str) {
        if let Some(fields) = self.services.read().get(service) {
            fields.write().remove(field);
        }
    }

    /// All fields of one service.
    pub fn service(&self, service: &str) -> BTreeMap<String, String> {
        self.services
            .read()
            .get(service)
            .map(|f| f.read().clone())
            .unwrap_or_default()
    }

    /// Consistent-per-service snapshot of every field, keyed by field name.
    pub fn all(&self) -> BTreeMap<String, String> {
        let services = self.services.read();
        let guards: Vec<_> = services.values().map(|f| f.read()).collect();

        guards
            .iter()
            .flat_map(|g| g.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }
}
