use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::evaluation::SecondaryExposure;
use crate::user::User;

/// Error surfaced by a [PersistentStorage] implementation. Failures are
/// logged at the overlay boundary and treated as "no persisted value"; they
/// never propagate to evaluation callers.
#[derive(Debug)]
pub struct StorageError {
    message: String,
}

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "persistent storage error: {}", self.message)
    }
}

impl std::error::Error for StorageError {}

/// Pluggable storage for sticky experiment assignments.
///
/// Records are grouped per unit under a `"{unit_id}:{id_type}"` key:
/// `load`/`load_async` return the serialized map of config name to assignment
/// record for that key (or None), while `save` and `delete` upsert or remove
/// a single named entry within it. Writes are last-write-wins and deleting an
/// absent entry must be a no-op.
#[async_trait]
pub trait PersistentStorage: Send + Sync {
    /// Load the serialized [UserPersistedValues] map stored under `key`.
    fn load(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Awaitable variant of [PersistentStorage::load] for adapters backed by
    /// asynchronous storage.
    async fn load_async(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Upsert the serialized assignment record for `config_name` under `key`.
    fn save(&self, key: &str, config_name: &str, data: &str) -> Result<(), StorageError>;

    /// Remove the assignment record for `config_name` under `key`.
    fn delete(&self, key: &str, config_name: &str) -> Result<(), StorageError>;
}

/// The persisted subset of a ConfigEvaluation, keyed by config name inside a
/// unit's storage entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StickyValues {
    pub value: bool,
    pub rule_id: String,
    #[serde(default)]
    pub json_value: serde_json::Value,
    #[serde(default)]
    pub secondary_exposures: Vec<SecondaryExposure>,
    #[serde(default)]
    pub undelegated_secondary_exposures: Vec<SecondaryExposure>,
    #[serde(default)]
    pub config_delegate: Option<String>,
    #[serde(default)]
    pub explicit_parameters: Option<Vec<String>>,
    #[serde(default)]
    pub is_experiment_group: bool,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub time: u64,
}

/// All sticky assignments stored for one unit, keyed by config name. Loaded
/// once per call site and passed into [crate::Evaluator::get_config] /
/// [crate::Evaluator::get_layer] by callers opting into persisted
/// assignments.
pub type UserPersistedValues = HashMap<String, StickyValues>;

/// Thin wrapper around an optional [PersistentStorage] collaborator that
/// owns key construction and the fail-open error handling.
pub(crate) struct PersistedValueStore {
    storage: Option<Arc<dyn PersistentStorage>>,
}

impl PersistedValueStore {
    pub(crate) fn new(storage: Option<Arc<dyn PersistentStorage>>) -> Self {
        Self { storage }
    }

    fn storage_key(user: &User, id_type: &str) -> Option<String> {
        user.unit_id(id_type)
            .map(|unit_id| format!("{}:{}", unit_id, id_type))
    }

    pub(crate) fn get_user_persisted_values(
        &self,
        user: &User,
        id_type: &str,
    ) -> Option<UserPersistedValues> {
        let storage = self.storage.as_ref()?;
        let key = Self::storage_key(user, id_type)?;
        match storage.load(&key) {
            Ok(Some(raw)) => parse_persisted_values(&raw),
            Ok(None) => None,
            Err(e) => {
                warn!("failed to load persisted values for {}: {}", key, e);
                None
            }
        }
    }

    pub(crate) async fn get_user_persisted_values_async(
        &self,
        user: &User,
        id_type: &str,
    ) -> Option<UserPersistedValues> {
        let storage = self.storage.as_ref()?;
        let key = Self::storage_key(user, id_type)?;
        match storage.load_async(&key).await {
            Ok(Some(raw)) => parse_persisted_values(&raw),
            Ok(None) => None,
            Err(e) => {
                warn!("failed to load persisted values for {}: {}", key, e);
                None
            }
        }
    }

    pub(crate) fn save(&self, user: &User, id_type: &str, name: &str, values: &StickyValues) {
        let (storage, key) = match (&self.storage, Self::storage_key(user, id_type)) {
            (Some(storage), Some(key)) => (storage, key),
            _ => return,
        };
        let data = match serde_json::to_string(values) {
            Ok(data) => data,
            Err(e) => {
                warn!("failed to serialize sticky values for {}: {}", name, e);
                return;
            }
        };
        if let Err(e) = storage.save(&key, name, &data) {
            warn!("failed to persist assignment {} for {}: {}", name, key, e);
        }
    }

    pub(crate) fn delete(&self, user: &User, id_type: &str, name: &str) {
        let (storage, key) = match (&self.storage, Self::storage_key(user, id_type)) {
            (Some(storage), Some(key)) => (storage, key),
            _ => return,
        };
        if let Err(e) = storage.delete(&key, name) {
            warn!("failed to delete assignment {} for {}: {}", name, key, e);
        }
    }
}

fn parse_persisted_values(raw: &str) -> Option<UserPersistedValues> {
    match serde_json::from_str(raw) {
        Ok(values) => Some(values),
        Err(e) => {
            warn!("discarding unparseable persisted values: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use spectral::prelude::*;

    use super::*;
    use crate::test_common::TestStorage;

    fn user() -> User {
        User::with_user_id("user-a").build()
    }

    fn sticky(rule_id: &str) -> StickyValues {
        StickyValues {
            value: true,
            rule_id: rule_id.to_string(),
            json_value: json!({"color": "blue"}),
            secondary_exposures: Vec::new(),
            undelegated_secondary_exposures: Vec::new(),
            config_delegate: None,
            explicit_parameters: None,
            is_experiment_group: true,
            group_name: Some("Control".to_string()),
            time: 42,
        }
    }

    #[test]
    fn no_storage_configured_means_no_values() {
        let store = PersistedValueStore::new(None);
        assert_that!(store.get_user_persisted_values(&user(), "userID")).is_none();

        // writes are silently dropped
        store.save(&user(), "userID", "exp", &sticky("r"));
        store.delete(&user(), "userID", "exp");
    }

    #[test]
    fn missing_unit_id_means_no_values() {
        let storage = Arc::new(TestStorage::new());
        let store = PersistedValueStore::new(Some(storage.clone()));

        let anonymous = User::anonymous().build();
        assert_that!(store.get_user_persisted_values(&anonymous, "userID")).is_none();
        store.save(&anonymous, "userID", "exp", &sticky("r"));
        assert_that!(storage.save_count()).is_equal_to(0);
    }

    #[test]
    fn save_then_load_round_trips_by_unit_key() {
        let storage = Arc::new(TestStorage::new());
        let store = PersistedValueStore::new(Some(storage.clone()));

        store.save(&user(), "userID", "button_color_experiment", &sticky("control_rule"));

        let values = store.get_user_persisted_values(&user(), "userID").unwrap();
        assert!(values.contains_key("button_color_experiment"));
        assert_eq!("control_rule", values["button_color_experiment"].rule_id);

        // a different id type resolves to a different storage key
        let keyed = User::with_user_id("user-a")
            .custom_id("stableID", "device-9")
            .build();
        assert_that!(store.get_user_persisted_values(&keyed, "stableID")).is_none();
    }

    #[test]
    fn load_errors_fail_open() {
        let storage = Arc::new(TestStorage::failing());
        let store = PersistedValueStore::new(Some(storage));
        assert_that!(store.get_user_persisted_values(&user(), "userID")).is_none();
    }

    #[test]
    fn write_errors_are_swallowed() {
        let storage = Arc::new(TestStorage::failing());
        let store = PersistedValueStore::new(Some(storage));
        store.save(&user(), "userID", "exp", &sticky("r"));
        store.delete(&user(), "userID", "exp");
    }

    #[test]
    fn unparseable_payloads_are_discarded() {
        let storage = Arc::new(TestStorage::new());
        storage.put_raw("user-a:userID", "not json");
        let store = PersistedValueStore::new(Some(storage));
        assert_that!(store.get_user_persisted_values(&user(), "userID")).is_none();
    }

    #[tokio::test]
    async fn async_load_matches_sync_load() {
        let storage = Arc::new(TestStorage::new());
        let store = PersistedValueStore::new(Some(storage));

        store.save(&user(), "userID", "exp", &sticky("control_rule"));

        let sync_values = store.get_user_persisted_values(&user(), "userID");
        let async_values = store.get_user_persisted_values_async(&user(), "userID").await;
        assert_that!(async_values).is_equal_to(sync_values);
    }
}
