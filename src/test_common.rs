#![cfg(test)]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::persisted::{PersistentStorage, StorageError};

// One rule set exercising every spec shape the evaluator handles. Bucketing
// expectations in the tests are derived from the SHA-256 prefixes of the
// salted hash inputs, e.g.:
//   "gate_salt.rollout_rule.user-a" % 10000 == 2257
//   "gate_salt.rollout_rule.user-c" % 10000 == 8629
//   "spec_salt.rule_salt.user-a"   % 10000 == 7039
//   "spec_salt.rule_id_1.user-a"   % 10000 == 6012
//   "bucket_salt.user-a"           %  1000 ==  257
//   "bucket_salt.user-b"           %  1000 ==  133
pub const TEST_PAYLOAD: &str = r#"{
    "feature_gates": [
        {
            "name": "public_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "entity": "feature_gate",
            "rules": [
                {
                    "name": "everyone",
                    "passPercentage": 100,
                    "conditions": [{"type": "public", "idType": "userID"}],
                    "returnValue": true,
                    "id": "rule_everyone",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "nobody_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "rules": [
                {
                    "name": "nobody",
                    "passPercentage": 0,
                    "conditions": [{"type": "public", "idType": "userID"}],
                    "returnValue": true,
                    "id": "rule_nobody",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "disabled_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": false,
            "idType": "userID",
            "rules": [
                {
                    "name": "everyone",
                    "passPercentage": 100,
                    "conditions": [{"type": "public", "idType": "userID"}],
                    "returnValue": true,
                    "id": "rule_everyone",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "partial_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "rules": [
                {
                    "name": "rollout",
                    "passPercentage": 50,
                    "conditions": [{"type": "public", "idType": "userID"}],
                    "returnValue": true,
                    "id": "rollout_rule",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "salted_precedence_gate",
            "type": "feature_gate",
            "salt": "spec_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "rules": [
                {
                    "name": "rollout",
                    "passPercentage": 65,
                    "conditions": [{"type": "public", "idType": "userID"}],
                    "returnValue": true,
                    "id": "rule_id_1",
                    "salt": "rule_salt",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "unsalted_precedence_gate",
            "type": "feature_gate",
            "salt": "spec_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "rules": [
                {
                    "name": "rollout",
                    "passPercentage": 65,
                    "conditions": [{"type": "public", "idType": "userID"}],
                    "returnValue": true,
                    "id": "rule_id_1",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "employee_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "rules": [
                {
                    "name": "employees",
                    "passPercentage": 100,
                    "conditions": [
                        {
                            "type": "user_field",
                            "targetValue": ["@example.com"],
                            "operator": "str_ends_with_any",
                            "field": "email",
                            "idType": "userID"
                        }
                    ],
                    "returnValue": true,
                    "id": "rule_employees",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "nested_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "rules": [
                {
                    "name": "depends",
                    "passPercentage": 100,
                    "conditions": [
                        {"type": "pass_gate", "targetValue": "public_gate", "idType": "userID"}
                    ],
                    "returnValue": true,
                    "id": "rule_depends",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "deep_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "rules": [
                {
                    "name": "deep",
                    "passPercentage": 100,
                    "conditions": [
                        {"type": "pass_gate", "targetValue": "nested_gate", "idType": "userID"}
                    ],
                    "returnValue": true,
                    "id": "rule_deep",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "blocked_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "rules": [
                {
                    "name": "blocked",
                    "passPercentage": 100,
                    "conditions": [
                        {"type": "fail_gate", "targetValue": "public_gate", "idType": "userID"}
                    ],
                    "returnValue": true,
                    "id": "rule_blocked",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "second_chance_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "rules": [
                {
                    "name": "first",
                    "passPercentage": 100,
                    "conditions": [
                        {"type": "pass_gate", "targetValue": "partial_gate", "idType": "userID"}
                    ],
                    "returnValue": true,
                    "id": "rule_first",
                    "idType": "userID"
                },
                {
                    "name": "second",
                    "passPercentage": 100,
                    "conditions": [{"type": "public", "idType": "userID"}],
                    "returnValue": true,
                    "id": "rule_second",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "bucket_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "rules": [
                {
                    "name": "low_buckets",
                    "passPercentage": 100,
                    "conditions": [
                        {
                            "type": "user_bucket",
                            "targetValue": 200,
                            "operator": "lt",
                            "additionalValues": {"salt": "bucket_salt"},
                            "idType": "userID"
                        }
                    ],
                    "returnValue": true,
                    "id": "rule_low_buckets",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "environment_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "rules": [
                {
                    "name": "production_only",
                    "passPercentage": 100,
                    "conditions": [
                        {
                            "type": "environment_field",
                            "targetValue": ["production"],
                            "operator": "any",
                            "field": "tier",
                            "idType": "userID"
                        }
                    ],
                    "returnValue": true,
                    "id": "rule_production_only",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "device_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "stableID",
            "rules": [
                {
                    "name": "allowlisted_devices",
                    "passPercentage": 100,
                    "conditions": [
                        {
                            "type": "unit_id",
                            "targetValue": ["device-9"],
                            "operator": "any_case_sensitive",
                            "idType": "stableID"
                        }
                    ],
                    "returnValue": true,
                    "id": "rule_allowlisted_devices",
                    "idType": "stableID"
                }
            ]
        },
        {
            "name": "launched_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "rules": [
                {
                    "name": "after_launch",
                    "passPercentage": 100,
                    "conditions": [
                        {
                            "type": "current_time",
                            "targetValue": 1600000000000,
                            "operator": "after",
                            "idType": "userID"
                        }
                    ],
                    "returnValue": true,
                    "id": "rule_after_launch",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "handle_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "rules": [
                {
                    "name": "short_handles",
                    "passPercentage": 100,
                    "conditions": [
                        {
                            "type": "user_field",
                            "targetValue": "^[a-z]+$",
                            "operator": "str_matches",
                            "field": "handle",
                            "idType": "userID"
                        }
                    ],
                    "returnValue": true,
                    "id": "rule_short_handles",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "segment_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "rules": [
                {
                    "name": "allowlist",
                    "passPercentage": 100,
                    "conditions": [
                        {
                            "type": "user_field",
                            "targetValue": ["list_1"],
                            "operator": "in_segment_list",
                            "field": "userID",
                            "idType": "userID"
                        }
                    ],
                    "returnValue": true,
                    "id": "rule_allowlist",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "script_gate",
            "type": "feature_gate",
            "salt": "gate_salt",
            "defaultValue": false,
            "enabled": true,
            "idType": "userID",
            "rules": [
                {
                    "name": "scripted",
                    "passPercentage": 100,
                    "conditions": [
                        {
                            "type": "javascript",
                            "additionalValues": {"javascript": "return true;"},
                            "idType": "userID"
                        }
                    ],
                    "returnValue": true,
                    "id": "rule_scripted",
                    "idType": "userID"
                }
            ]
        }
    ],
    "dynamic_configs": [
        {
            "name": "headline_config",
            "type": "dynamic_config",
            "salt": "config_salt",
            "defaultValue": {"headline": "Hello"},
            "enabled": true,
            "idType": "userID",
            "entity": "dynamic_config",
            "rules": [
                {
                    "name": "employees",
                    "groupName": "Employees",
                    "passPercentage": 100,
                    "conditions": [
                        {
                            "type": "user_field",
                            "targetValue": ["@example.com"],
                            "operator": "str_ends_with_any",
                            "field": "email",
                            "idType": "userID"
                        }
                    ],
                    "returnValue": {"headline": "Welcome back"},
                    "id": "rule_config_employees",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "button_color_experiment",
            "type": "dynamic_config",
            "salt": "exp_salt",
            "defaultValue": {"color": "gray"},
            "enabled": true,
            "idType": "userID",
            "entity": "experiment",
            "isActive": true,
            "explicitParameters": ["color"],
            "rules": [
                {
                    "name": "Control",
                    "groupName": "Control",
                    "passPercentage": 100,
                    "conditions": [{"type": "public", "idType": "userID"}],
                    "returnValue": {"color": "blue"},
                    "id": "control_rule",
                    "salt": "exp_rule_salt",
                    "isExperimentGroup": true,
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "retired_experiment",
            "type": "dynamic_config",
            "salt": "exp_salt",
            "defaultValue": {"color": "gray"},
            "enabled": true,
            "idType": "userID",
            "entity": "experiment",
            "isActive": false,
            "explicitParameters": ["color"],
            "rules": [
                {
                    "name": "Control",
                    "groupName": "Control",
                    "passPercentage": 100,
                    "conditions": [{"type": "public", "idType": "userID"}],
                    "returnValue": {"color": "red"},
                    "id": "retired_rule",
                    "isExperimentGroup": true,
                    "idType": "userID"
                }
            ]
        }
    ],
    "layer_configs": [
        {
            "name": "cta_layer",
            "type": "layer",
            "salt": "layer_salt",
            "defaultValue": {"cta": "Sign up", "color": "gray"},
            "enabled": true,
            "idType": "userID",
            "entity": "layer",
            "explicitParameters": [],
            "rules": [
                {
                    "name": "allocation",
                    "passPercentage": 100,
                    "conditions": [{"type": "public", "idType": "userID"}],
                    "returnValue": {"cta": "Buy now"},
                    "id": "alloc_rule",
                    "configDelegate": "button_color_experiment",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "zero_percent_layer",
            "type": "layer",
            "salt": "layer_salt",
            "defaultValue": {"cta": "Sign up"},
            "enabled": true,
            "idType": "userID",
            "explicitParameters": [],
            "rules": [
                {
                    "name": "allocation",
                    "passPercentage": 0,
                    "conditions": [{"type": "public", "idType": "userID"}],
                    "returnValue": {"cta": "Buy now"},
                    "id": "zero_alloc_rule",
                    "configDelegate": "button_color_experiment",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "dangling_delegate_layer",
            "type": "layer",
            "salt": "layer_salt",
            "defaultValue": {"cta": "Sign up"},
            "enabled": true,
            "idType": "userID",
            "explicitParameters": [],
            "rules": [
                {
                    "name": "allocation",
                    "passPercentage": 100,
                    "conditions": [{"type": "public", "idType": "userID"}],
                    "returnValue": {"cta": "Fallback"},
                    "id": "dangling_alloc_rule",
                    "configDelegate": "missing_experiment",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "retired_layer",
            "type": "layer",
            "salt": "layer_salt",
            "defaultValue": {"cta": "Sign up"},
            "enabled": true,
            "idType": "userID",
            "explicitParameters": [],
            "rules": [
                {
                    "name": "allocation",
                    "passPercentage": 100,
                    "conditions": [{"type": "public", "idType": "userID"}],
                    "returnValue": {"cta": "Buy now"},
                    "id": "retired_alloc_rule",
                    "configDelegate": "retired_experiment",
                    "idType": "userID"
                }
            ]
        },
        {
            "name": "plain_layer",
            "type": "layer",
            "salt": "layer_salt",
            "defaultValue": {"cta": "Sign up"},
            "enabled": true,
            "idType": "userID",
            "explicitParameters": [],
            "rules": [
                {
                    "name": "everyone",
                    "passPercentage": 100,
                    "conditions": [{"type": "public", "idType": "userID"}],
                    "returnValue": {"cta": "Try it"},
                    "id": "layer_rule",
                    "idType": "userID"
                }
            ]
        }
    ],
    "time": 1700000000000
}"#;

pub fn test_payload() -> serde_json::Value {
    serde_json::from_str(TEST_PAYLOAD).unwrap()
}

/// The same rule set after every experiment has been wound down: all
/// `isActive` flags flip to false.
pub fn test_payload_with_inactive_experiments() -> serde_json::Value {
    let mut payload = test_payload();
    if let Some(configs) = payload["dynamic_configs"].as_array_mut() {
        for config in configs {
            if config.get("isActive").is_some() {
                config["isActive"] = serde_json::Value::Bool(false);
            }
        }
    }
    payload
}

/// In-memory [PersistentStorage] that keeps the serialized map per unit key,
/// the way a local-storage adapter would, and records every write for
/// assertions.
pub struct TestStorage {
    cells: Mutex<HashMap<String, String>>,
    saves: Mutex<Vec<(String, String)>>,
    deletes: Mutex<Vec<(String, String)>>,
    fail_everything: bool,
}

impl TestStorage {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            saves: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            fail_everything: false,
        }
    }

    /// A storage collaborator whose every operation errors.
    pub fn failing() -> Self {
        Self {
            fail_everything: true,
            ..Self::new()
        }
    }

    /// Seed a raw serialized value under a unit key, bypassing `save`.
    pub fn put_raw(&self, key: &str, raw: &str) {
        self.cells
            .lock()
            .unwrap()
            .insert(key.to_string(), raw.to_string());
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().unwrap().len()
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.lock().unwrap().len()
    }

    pub fn saves(&self) -> Vec<(String, String)> {
        self.saves.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<(String, String)> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl PersistentStorage for TestStorage {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        if self.fail_everything {
            return Err(StorageError::new("load failed"));
        }
        Ok(self.cells.lock().unwrap().get(key).cloned())
    }

    async fn load_async(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.load(key)
    }

    fn save(&self, key: &str, config_name: &str, data: &str) -> Result<(), StorageError> {
        if self.fail_everything {
            return Err(StorageError::new("save failed"));
        }
        let record: serde_json::Value =
            serde_json::from_str(data).map_err(|e| StorageError::new(e.to_string()))?;

        let mut cells = self.cells.lock().unwrap();
        let mut map: serde_json::Map<String, serde_json::Value> = cells
            .get(key)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        map.insert(config_name.to_string(), record);
        cells.insert(key.to_string(), serde_json::to_string(&map).unwrap());

        self.saves
            .lock()
            .unwrap()
            .push((key.to_string(), config_name.to_string()));
        Ok(())
    }

    fn delete(&self, key: &str, config_name: &str) -> Result<(), StorageError> {
        if self.fail_everything {
            return Err(StorageError::new("delete failed"));
        }
        let mut cells = self.cells.lock().unwrap();
        if let Some(raw) = cells.get(key).cloned() {
            if let Ok(mut map) =
                serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&raw)
            {
                map.remove(config_name);
                cells.insert(key.to_string(), serde_json::to_string(&map).unwrap());
            }
        }
        self.deletes
            .lock()
            .unwrap()
            .push((key.to_string(), config_name.to_string()));
        Ok(())
    }
}
