//! Global settings namespace.
//!
//! Modules may declare default settings. They are merged into this namespace
//! once per module load: keys that already hold a value (typically a user
//! choice) are never overwritten.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Namespaced key/value settings shared by all modules of one registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalSettings {
    namespaces: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    #[serde(skip)]
    merged_modules: HashSet<Uuid>,
}

impl GlobalSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<&serde_json::Value> {
        self.namespaces.get(namespace).and_then(|ns| ns.get(key))
    }

    pub fn set(&mut self, namespace: &str, key: &str, value: serde_json::Value) {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn namespace(&self, namespace: &str) -> Option<&BTreeMap<String, serde_json::Value>> {
        self.namespaces.get(namespace)
    }

    /// Merge `defaults` for `module_id` under `namespace`.
    ///
    /// Returns `false` without touching anything if this module's defaults were
    /// already merged.
    pub fn merge_module_defaults(
        &mut self,
        module_id: Uuid,
        namespace: &str,
        defaults: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> bool {
        if !self.merged_modules.insert(module_id) {
            return false;
        }
        let ns = self.namespaces.entry(namespace.to_string()).or_default();
        for (key, value) in defaults {
            ns.entry(key).or_insert(value);
        }
        tracing::debug!("Merged default settings for module {} into '{}'", module_id, namespace);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_once_and_keep_user_values() {
        let mut settings = GlobalSettings::new();
        let id = Uuid::new_v4();
        settings.set("Labels", "Font size", json!(14));

        let merged = settings.merge_module_defaults(
            id,
            "Labels",
            vec![
                ("Font size".to_string(), json!(10)),
                ("Italic".to_string(), json!(false)),
            ],
        );
        assert!(merged);
        assert_eq!(settings.get("Labels", "Font size"), Some(&json!(14)));
        assert_eq!(settings.get("Labels", "Italic"), Some(&json!(false)));

        settings.set("Labels", "Italic", json!(true));
        let again = settings.merge_module_defaults(id, "Labels", vec![("Italic".to_string(), json!(false))]);
        assert!(!again);
        assert_eq!(settings.get("Labels", "Italic"), Some(&json!(true)));
    }
}
