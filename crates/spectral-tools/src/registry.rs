use crate::params::require_str;
use serde_json::json;
use spectral_core::ActionResult;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Registry value store. On Windows this would shell out to the native
/// registry; elsewhere it is an in-process hive so plans that touch
/// registry tools stay executable, with results marked simulated.
#[derive(Debug, Clone, Default)]
pub struct RegistryHive {
    values: Arc<Mutex<BTreeMap<(String, String), String>>>,
}

impl RegistryHive {
    pub fn get(&self, key: &str, name: &str) -> Option<String> {
        self.values
            .lock()
            .expect("registry lock poisoned")
            .get(&(key.to_string(), name.to_string()))
            .cloned()
    }

    fn set(&self, key: &str, name: &str, value: &str) {
        self.values
            .lock()
            .expect("registry lock poisoned")
            .insert((key.to_string(), name.to_string()), value.to_string());
    }

    fn remove(&self, key: &str, name: &str) -> bool {
        self.values
            .lock()
            .expect("registry lock poisoned")
            .remove(&(key.to_string(), name.to_string()))
            .is_some()
    }

    pub fn is_simulated(&self) -> bool {
        !cfg!(target_os = "windows")
    }
}

pub struct RegistryActions {
    hive: RegistryHive,
}

impl RegistryActions {
    pub fn new(hive: RegistryHive) -> Self {
        Self { hive }
    }

    fn key_and_name(params: &serde_json::Value) -> Result<(String, String), String> {
        let key = require_str(params, &["key", "registry_key"])?;
        let name = require_str(params, &["name", "value_name"])?;
        Ok((key, name))
    }

    pub fn read_value(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "registry_read_value";
        let (key, name) = match Self::key_and_name(params) {
            Ok(pair) => pair,
            Err(err) => return ActionResult::fail(ACTION, err),
        };
        match self.hive.get(&key, &name) {
            Some(value) => ActionResult::ok(ACTION, format!("Read {key}\\{name}"))
                .with_data(json!({"key": key, "name": name, "value": value,
                                  "simulated": self.hive.is_simulated()})),
            None => ActionResult::fail(
                ACTION,
                format!("registry value does not exist: {key}\\{name}"),
            ),
        }
    }

    pub fn write_value(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "registry_write_value";
        let (key, name) = match Self::key_and_name(params) {
            Ok(pair) => pair,
            Err(err) => return ActionResult::fail(ACTION, err),
        };
        let value = match require_str(params, &["value", "data"]) {
            Ok(v) => v,
            Err(err) => return ActionResult::fail(ACTION, err),
        };
        self.hive.set(&key, &name, &value);
        ActionResult::ok(ACTION, format!("Wrote {key}\\{name}"))
            .with_data(json!({"key": key, "name": name, "value": value,
                              "simulated": self.hive.is_simulated()}))
    }

    pub fn delete_value(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "registry_delete_value";
        let (key, name) = match Self::key_and_name(params) {
            Ok(pair) => pair,
            Err(err) => return ActionResult::fail(ACTION, err),
        };
        if self.hive.remove(&key, &name) {
            ActionResult::ok(ACTION, format!("Deleted {key}\\{name}"))
                .with_data(json!({"key": key, "name": name,
                                  "simulated": self.hive.is_simulated()}))
        } else {
            ActionResult::fail(
                ACTION,
                format!("registry value does not exist: {key}\\{name}"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_read_delete_cycle() {
        let hive = RegistryHive::default();
        let registry = RegistryActions::new(hive.clone());
        let params = json!({"key": r"HKCU\Software\Spectral", "name": "Theme", "value": "dark"});

        assert!(registry.write_value(&params).success);
        assert_eq!(
            hive.get(r"HKCU\Software\Spectral", "Theme").as_deref(),
            Some("dark")
        );

        let read = registry.read_value(&params);
        assert!(read.success);
        assert_eq!(read.data.expect("data")["value"], "dark");

        assert!(registry.delete_value(&params).success);
        let missing = registry.delete_value(&params);
        assert!(!missing.success);
        assert!(missing.error.expect("error").contains("does not exist"));
    }
}
