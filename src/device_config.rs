//! Recognized upgrade types, work types and the environment → address map
//! used to populate upgrade forms.

use crate::store::NewTask;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceConfig {
    pub upgrade_types: Vec<String>,
    pub work_types: Vec<String>,
    pub environments: BTreeMap<String, Vec<String>>,
}

impl DeviceConfig {
    /// Decodes the stored JSON columns. A column that no longer parses is
    /// logged and read back as empty rather than failing the request.
    pub fn from_columns(upgrade_types: &str, work_types: &str, environments: &str) -> Self {
        Self {
            upgrade_types: decode_column("upgrade_types", upgrade_types),
            work_types: decode_column("work_types", work_types),
            environments: decode_column("environments", environments),
        }
    }

    pub fn to_columns(&self) -> (String, String, String) {
        (
            serde_json::to_string(&self.upgrade_types).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&self.work_types).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&self.environments).unwrap_or_else(|_| "{}".into()),
        )
    }

    pub fn to_json(&self) -> Value {
        let environments: Vec<Value> = self
            .environments
            .iter()
            .map(|(env, ips)| json!({ "ne_env": env, "ne_ip_list": ips }))
            .collect();
        json!({
            "upgrade_type": self.upgrade_types,
            "work_type": self.work_types,
            "environments": environments,
        })
    }

    /// Applies a partial update. Fields absent from `body` are kept.
    ///
    /// `upgrade_type` / `work_type` take either an array of strings or one
    /// newline-separated string. `environments` takes an array of
    /// `{ne_env, ne_ip_list}` objects or the same array encoded as a JSON
    /// string; entries missing either key are skipped.
    pub fn apply_update(&mut self, body: &Map<String, Value>) -> Result<(), String> {
        if let Some(value) = body.get("upgrade_type") {
            self.upgrade_types = parse_type_list("upgrade_type", value)?;
        }
        if let Some(value) = body.get("work_type") {
            self.work_types = parse_type_list("work_type", value)?;
        }
        if let Some(value) = body.get("environments") {
            self.environments = parse_environments(value)?;
        }
        Ok(())
    }

    /// Strict-mode check for a new task. Only categories that are actually
    /// configured (non-empty) constrain the request.
    pub fn validate_task(&self, task: &NewTask) -> Result<(), String> {
        if !self.upgrade_types.is_empty() && !self.upgrade_types.contains(&task.upgrade_type) {
            return Err(format!(
                "upgrade_type {:?} is not one of the configured types",
                task.upgrade_type
            ));
        }
        if !self.work_types.is_empty() && !self.work_types.contains(&task.work_type) {
            return Err(format!(
                "work_type {:?} is not one of the configured types",
                task.work_type
            ));
        }
        if !self.environments.is_empty() {
            for address in task.target_address.split(',').map(str::trim) {
                let known = self
                    .environments
                    .values()
                    .any(|ips| ips.iter().any(|ip| ip == address));
                if !known {
                    return Err(format!(
                        "target address {address:?} is not listed in any environment"
                    ));
                }
            }
        }
        Ok(())
    }
}

fn decode_column<T: serde::de::DeserializeOwned + Default>(column: &str, raw: &str) -> T {
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(column, raw, error = %err, "device-config-decode-failed");
            T::default()
        }
    }
}

fn parse_type_list(field: &str, value: &Value) -> Result<Vec<String>, String> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(raw) => Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
                _ => Err(format!("{field} entries must be non-empty strings")),
            })
            .collect(),
        _ => Err(format!("{field} must be a string or an array of strings")),
    }
}

fn parse_environments(value: &Value) -> Result<BTreeMap<String, Vec<String>>, String> {
    let decoded;
    let items = match value {
        Value::Null => return Ok(BTreeMap::new()),
        Value::String(raw) => {
            decoded = serde_json::from_str::<Value>(raw)
                .map_err(|_| "environments: invalid JSON format".to_string())?;
            match &decoded {
                Value::Array(items) => items,
                _ => return Err("environments must be an array".into()),
            }
        }
        Value::Array(items) => items,
        _ => return Err("environments must be an array".into()),
    };

    let mut map = BTreeMap::new();
    for item in items {
        let (Some(env), Some(ips)) = (item.get("ne_env"), item.get("ne_ip_list")) else {
            continue;
        };
        let Some(env) = env.as_str() else {
            return Err("ne_env must be a string".into());
        };
        let ips = match ips {
            Value::Array(list) => list
                .iter()
                .filter_map(|ip| ip.as_str())
                .map(|ip| ip.trim().to_string())
                .filter(|ip| !ip.is_empty())
                .collect(),
            Value::String(raw) => raw
                .split([',', '\n'])
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(str::to_string)
                .collect(),
            _ => return Err(format!("ne_ip_list for {env} must be a list")),
        };
        map.insert(env.to_string(), ips);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sample_task;

    fn body(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn newline_strings_and_arrays_both_set_type_lists() {
        let mut config = DeviceConfig::default();
        config
            .apply_update(&body(json!({
                "upgrade_type": "force\n  normal \n\n",
                "work_type": ["single_process", "batch"],
            })))
            .unwrap();
        assert_eq!(config.upgrade_types, vec!["force", "normal"]);
        assert_eq!(config.work_types, vec!["single_process", "batch"]);
    }

    #[test]
    fn partial_update_keeps_untouched_fields() {
        let mut config = DeviceConfig {
            upgrade_types: vec!["force".into()],
            ..DeviceConfig::default()
        };
        config
            .apply_update(&body(json!({ "work_type": "batch" })))
            .unwrap();
        assert_eq!(config.upgrade_types, vec!["force"]);
        assert_eq!(config.work_types, vec!["batch"]);
    }

    #[test]
    fn environments_accept_json_string_and_skip_incomplete_entries() {
        let mut config = DeviceConfig::default();
        let encoded = json!([
            { "ne_env": "lab", "ne_ip_list": ["200.200.18.101", "200.200.18.102"] },
            { "ne_env": "missing-list" },
        ])
        .to_string();
        config
            .apply_update(&body(json!({ "environments": encoded })))
            .unwrap();
        assert_eq!(config.environments.len(), 1);
        assert_eq!(config.environments["lab"].len(), 2);

        let err = config
            .apply_update(&body(json!({ "environments": "{not json" })))
            .unwrap_err();
        assert!(err.contains("invalid JSON"));
    }

    #[test]
    fn json_view_lists_environments_as_objects() {
        let mut config = DeviceConfig::default();
        config.environments.insert("lab".into(), vec!["10.0.0.1".into()]);
        let view = config.to_json();
        assert_eq!(view["environments"][0]["ne_env"], Value::from("lab"));
        assert_eq!(view["environments"][0]["ne_ip_list"][0], Value::from("10.0.0.1"));
        assert_eq!(view["upgrade_type"], json!([]));
    }

    #[test]
    fn corrupt_columns_decode_as_empty() {
        let config = DeviceConfig::from_columns("[\"force\"]", "not-json", "{}");
        assert_eq!(config.upgrade_types, vec!["force"]);
        assert!(config.work_types.is_empty());
    }

    #[test]
    fn strict_validation_only_checks_configured_categories() {
        let task = sample_task();
        assert!(DeviceConfig::default().validate_task(&task).is_ok());

        let config = DeviceConfig {
            upgrade_types: vec!["normal".into()],
            ..DeviceConfig::default()
        };
        assert!(config.validate_task(&task).unwrap_err().contains("upgrade_type"));

        let mut config = DeviceConfig {
            upgrade_types: vec!["force".into()],
            work_types: vec!["single_process".into()],
            ..DeviceConfig::default()
        };
        config
            .environments
            .insert("lab".into(), vec!["200.200.18.101".into()]);
        assert!(config.validate_task(&task).is_ok());

        let mut multi = task.clone();
        multi.target_address = "200.200.18.101,10.9.9.9".into();
        assert!(config.validate_task(&multi).unwrap_err().contains("10.9.9.9"));
    }
}
