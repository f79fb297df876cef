//! Quest Persistence
//!
//! Saved layout of a quest instance and the key-value store it is written
//! to. One entry per quest id:
//!
//! ```json
//! { "state": 2, "currentStepIndex": 0, "stepStates": [ { "state": 1 } ] }
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::definition::QuestDefinition;
use super::state::{QuestInstance, QuestState, StepState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to write '{key}': {reason}")]
    Write { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("corrupt quest payload: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Saved step entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedStep {
    pub state: StepState,
}

/// Saved quest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedQuest {
    pub state: QuestState,
    /// -1 when no step is active
    pub current_step_index: i32,
    #[serde(default)]
    pub step_states: Vec<SavedStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl SavedQuest {
    pub fn capture(quest: &QuestInstance) -> Self {
        Self {
            state: quest.state(),
            current_step_index: quest
                .current_step()
                .and_then(|index| i32::try_from(index).ok())
                .unwrap_or(-1),
            step_states: quest
                .step_states()
                .iter()
                .map(|state| SavedStep { state: *state })
                .collect(),
            started_at: quest.started_at,
            finished_at: quest.finished_at,
        }
    }

    /// Rebuild an instance against the current definition. Step data is
    /// padded or truncated to fit, see `QuestInstance::restore`.
    pub fn into_instance(self, definition: Arc<QuestDefinition>) -> QuestInstance {
        let current_step = usize::try_from(self.current_step_index).ok();
        let step_states = self.step_states.into_iter().map(|s| s.state).collect();
        let mut quest = QuestInstance::restore(definition, self.state, current_step, step_states);
        quest.started_at = self.started_at;
        quest.finished_at = self.finished_at;
        quest
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, RestoreError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Durable key-value store for saved quests
pub trait QuestStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn put(&mut self, key: &str, value: String) -> Result<(), StoreError>;

    /// Entries written since the last drain, for write-behind backends
    fn drain_dirty(&mut self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Flag an entry for another flush attempt
    fn mark_dirty(&mut self, _key: &str) {}
}

/// In-memory store. Doubles as the write-behind cache in front of SQLite:
/// seeded from the database at startup, dirty entries flushed every tick.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: HashMap<String, String>,
    dirty: BTreeSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: HashMap<String, String>) -> Self {
        Self {
            entries,
            dirty: BTreeSet::new(),
        }
    }
}

impl QuestStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        self.dirty.insert(key.to_string());
        Ok(())
    }

    fn drain_dirty(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.dirty)
            .into_iter()
            .filter_map(|key| {
                let value = self.entries.get(&key)?.clone();
                Some((key, value))
            })
            .collect()
    }

    fn mark_dirty(&mut self, key: &str) {
        if self.entries.contains_key(key) {
            self.dirty.insert(key.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quest::definition::tests::definition;

    #[test]
    fn test_layout() {
        let def = Arc::new(definition("q", 2, &[]));
        let mut quest = QuestInstance::new(def, QuestState::CanStart);
        quest.begin();
        quest.set_step_state(0, StepState::Running);

        let json = SavedQuest::capture(&quest).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["state"], 2);
        assert_eq!(value["currentStepIndex"], 0);
        assert_eq!(value["stepStates"][0]["state"], 1);
        assert_eq!(value["stepStates"][1]["state"], 0);
    }

    #[test]
    fn test_round_trip_every_state() {
        let def = Arc::new(definition("q", 3, &[]));
        let step_mixes = [
            vec![StepState::NotStarted; 3],
            vec![StepState::Finished, StepState::Running, StepState::NotStarted],
            vec![StepState::Finished; 3],
        ];

        for state in QuestState::ALL {
            for steps in &step_mixes {
                let indices: Vec<Option<usize>> = if state == QuestState::InProgress {
                    vec![Some(0), Some(1), Some(2)]
                } else {
                    vec![None]
                };
                for index in indices {
                    let original = QuestInstance::restore(def.clone(), state, index, steps.clone());
                    let json = SavedQuest::capture(&original).to_json().unwrap();
                    let restored = SavedQuest::from_json(&json).unwrap().into_instance(def.clone());

                    assert_eq!(restored.state(), original.state());
                    assert_eq!(restored.current_step(), original.current_step());
                    assert_eq!(restored.step_states(), original.step_states());
                }
            }
        }
    }

    #[test]
    fn test_shortened_payload_is_padded() {
        let def = Arc::new(definition("q", 4, &[]));
        let json = r#"{"state":2,"currentStepIndex":9,"stepStates":[{"state":2}]}"#;
        let quest = SavedQuest::from_json(json).unwrap().into_instance(def);

        assert_eq!(quest.step_states().len(), 4);
        assert_eq!(quest.step_states()[0], StepState::Finished);
        assert_eq!(quest.step_states()[3], StepState::NotStarted);
        assert_eq!(quest.current_step(), Some(3));
    }

    #[test]
    fn test_missing_step_states_field() {
        let def = Arc::new(definition("q", 2, &[]));
        let json = r#"{"state":1,"currentStepIndex":-1}"#;
        let quest = SavedQuest::from_json(json).unwrap().into_instance(def);
        assert_eq!(quest.state(), QuestState::CanStart);
        assert_eq!(quest.step_states().len(), 2);
    }

    #[test]
    fn test_corrupt_payloads() {
        assert!(SavedQuest::from_json("not json").is_err());
        assert!(SavedQuest::from_json(r#"{"state":42,"currentStepIndex":0}"#).is_err());
        assert!(SavedQuest::from_json(r#"{"state":2,"currentStepIndex":0,"stepStates":[{"state":7}]}"#).is_err());
    }

    #[test]
    fn test_memory_store_dirty_tracking() {
        let mut store = MemoryStore::new();
        store.put("a", "1".to_string()).unwrap();
        store.put("b", "2".to_string()).unwrap();
        store.put("a", "3".to_string()).unwrap();

        let dirty = store.drain_dirty();
        assert_eq!(dirty, vec![("a".to_string(), "3".to_string()), ("b".to_string(), "2".to_string())]);
        assert!(store.drain_dirty().is_empty());

        store.mark_dirty("b");
        store.mark_dirty("missing");
        assert_eq!(store.drain_dirty().len(), 1);
        assert_eq!(store.get("a").unwrap(), Some("3".to_string()));
    }
}
