use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use renter_fs::FileUid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A currently firing alert, keyed by a stable id so re-registering
/// refreshes it in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub msg: String,
    pub cause: String,
    pub severity: AlertSeverity,
}

/// The alert id for a file whose redundancy dropped too low.
pub fn file_low_redundancy_alert_id(uid: &FileUid) -> String {
    format!("file-low-redundancy-{}", uid)
}

/// In-memory registry of active alerts. Registering an id twice keeps a
/// single entry with the latest message.
#[derive(Default)]
pub struct AlertRegistry {
    alerts: Mutex<HashMap<String, Alert>>,
}

impl AlertRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_alert(&self, id: &str, msg: &str, cause: &str, severity: AlertSeverity) {
        let mut alerts = self.alerts.lock().unwrap();
        alerts.insert(
            id.to_string(),
            Alert {
                id: id.to_string(),
                msg: msg.to_string(),
                cause: cause.to_string(),
                severity,
            },
        );
    }

    pub fn unregister_alert(&self, id: &str) {
        self.alerts.lock().unwrap().remove(id);
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.alerts.lock().unwrap().contains_key(id)
    }

    /// Active alerts sorted by id for a stable listing.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut out: Vec<Alert> = self.alerts.lock().unwrap().values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_refresh_unregister() {
        let registry = AlertRegistry::new();
        registry.register_alert("a", "first", "cause", AlertSeverity::Warning);
        registry.register_alert("a", "second", "cause", AlertSeverity::Warning);
        assert_eq!(registry.active_alerts().len(), 1);
        assert_eq!(registry.active_alerts()[0].msg, "second");

        registry.unregister_alert("a");
        assert!(!registry.is_registered("a"));
        // Unregistering an unknown id is fine.
        registry.unregister_alert("a");
    }
}
