//! Quest State Tracking
//!
//! Lifecycle and step states plus the per-quest runtime instance. Instances
//! are passive: they never publish events or touch storage, the engine does.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::definition::QuestDefinition;

/// Lifecycle state of a quest, ordered by progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum QuestState {
    /// Level or prerequisite requirements are not satisfied yet
    RequirementsNotMet,
    /// Quest can be accepted
    CanStart,
    /// Quest has an active step
    InProgress,
    /// All steps are done, ready to turn in
    CanFinish,
    /// Rewards granted, quest closed
    Finished,
}

impl QuestState {
    pub const ALL: [QuestState; 5] = [
        QuestState::RequirementsNotMet,
        QuestState::CanStart,
        QuestState::InProgress,
        QuestState::CanFinish,
        QuestState::Finished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuestState::RequirementsNotMet => "requirements_not_met",
            QuestState::CanStart => "can_start",
            QuestState::InProgress => "in_progress",
            QuestState::CanFinish => "can_finish",
            QuestState::Finished => "finished",
        }
    }
}

impl fmt::Display for QuestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<QuestState> for i32 {
    fn from(state: QuestState) -> Self {
        match state {
            QuestState::RequirementsNotMet => 0,
            QuestState::CanStart => 1,
            QuestState::InProgress => 2,
            QuestState::CanFinish => 3,
            QuestState::Finished => 4,
        }
    }
}

impl TryFrom<i32> for QuestState {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QuestState::RequirementsNotMet),
            1 => Ok(QuestState::CanStart),
            2 => Ok(QuestState::InProgress),
            3 => Ok(QuestState::CanFinish),
            4 => Ok(QuestState::Finished),
            other => Err(format!("invalid quest state {}", other)),
        }
    }
}

/// State of a single quest step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum StepState {
    #[default]
    NotStarted,
    Running,
    Finished,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::NotStarted => "not_started",
            StepState::Running => "running",
            StepState::Finished => "finished",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "not_started" | "0" => Some(StepState::NotStarted),
            "running" | "1" => Some(StepState::Running),
            "finished" | "2" => Some(StepState::Finished),
            _ => None,
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<StepState> for i32 {
    fn from(state: StepState) -> Self {
        match state {
            StepState::NotStarted => 0,
            StepState::Running => 1,
            StepState::Finished => 2,
        }
    }
}

impl TryFrom<i32> for StepState {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StepState::NotStarted),
            1 => Ok(StepState::Running),
            2 => Ok(StepState::Finished),
            other => Err(format!("invalid step state {}", other)),
        }
    }
}

/// Runtime state of one quest
#[derive(Debug, Clone)]
pub struct QuestInstance {
    definition: Arc<QuestDefinition>,
    state: QuestState,
    current_step: Option<usize>,
    step_states: Vec<StepState>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QuestInstance {
    /// Fresh instance with every step not started
    pub fn new(definition: Arc<QuestDefinition>, state: QuestState) -> Self {
        let step_states = vec![StepState::NotStarted; definition.steps.len()];
        Self {
            definition,
            state,
            current_step: None,
            step_states,
            started_at: None,
            finished_at: None,
        }
    }

    /// Rebuild an instance from saved fields.
    ///
    /// `step_states` is padded with `NotStarted` or truncated to the step
    /// count of `definition`, and the step index is clamped into range, so a
    /// payload written against an older definition can never index out of
    /// bounds.
    pub fn restore(
        definition: Arc<QuestDefinition>,
        state: QuestState,
        current_step: Option<usize>,
        mut step_states: Vec<StepState>,
    ) -> Self {
        let step_count = definition.steps.len();
        step_states.resize(step_count, StepState::NotStarted);

        let current_step = if state == QuestState::InProgress && step_count > 0 {
            Some(current_step.unwrap_or(0).min(step_count - 1))
        } else {
            None
        };

        Self {
            definition,
            state,
            current_step,
            step_states,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &Arc<QuestDefinition> {
        &self.definition
    }

    pub fn state(&self) -> QuestState {
        self.state
    }

    pub fn current_step(&self) -> Option<usize> {
        self.current_step
    }

    pub fn step_states(&self) -> &[StepState] {
        &self.step_states
    }

    pub fn is_in(&self, state: QuestState) -> bool {
        self.state == state
    }

    /// Whether the step index points at a defined step
    pub fn current_step_exists(&self) -> bool {
        self.current_step
            .is_some_and(|index| index < self.definition.steps.len())
    }

    pub fn set_state(&mut self, state: QuestState) {
        self.state = state;
        if state != QuestState::InProgress {
            self.current_step = None;
        }
    }

    /// Enter the first step
    pub fn begin(&mut self) {
        self.state = QuestState::InProgress;
        self.current_step = Some(0);
    }

    /// Move to the next step. Returns false when no step is left, in which
    /// case the index is cleared.
    pub fn advance_step(&mut self) -> bool {
        let next = self.current_step.map_or(0, |index| index + 1);
        if next < self.definition.steps.len() {
            self.current_step = Some(next);
            true
        } else {
            self.current_step = None;
            false
        }
    }

    /// Record a step state. Returns false if the index is out of range.
    pub fn set_step_state(&mut self, step_index: usize, state: StepState) -> bool {
        match self.step_states.get_mut(step_index) {
            Some(slot) => {
                *slot = state;
                true
            }
            None => false,
        }
    }

    /// Swap in a new definition, keeping progress where it still fits
    pub fn rebind(&mut self, definition: Arc<QuestDefinition>) {
        let mut rebound = Self::restore(
            definition,
            self.state,
            self.current_step,
            std::mem::take(&mut self.step_states),
        );
        rebound.started_at = self.started_at;
        rebound.finished_at = self.finished_at;
        *self = rebound;
    }

    /// Read-only copy handed to listeners
    pub fn snapshot(&self) -> QuestSnapshot {
        QuestSnapshot {
            quest_id: self.definition.id.clone(),
            name: self.definition.name.clone(),
            state: self.state,
            current_step: self.current_step,
            step_states: self.step_states.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Snapshot of a quest published with `QuestStateChanged`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestSnapshot {
    pub quest_id: String,
    pub name: String,
    pub state: QuestState,
    pub current_step: Option<usize>,
    pub step_states: Vec<StepState>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QuestSnapshot {
    /// Number of finished steps, for quest log display
    pub fn finished_steps(&self) -> usize {
        self.step_states
            .iter()
            .filter(|s| **s == StepState::Finished)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quest::definition::tests::definition;

    #[test]
    fn test_quest_state_order() {
        assert!(QuestState::RequirementsNotMet < QuestState::CanStart);
        assert!(QuestState::CanStart < QuestState::InProgress);
        assert!(QuestState::InProgress < QuestState::CanFinish);
        assert!(QuestState::CanFinish < QuestState::Finished);
    }

    #[test]
    fn test_state_int_mapping() {
        for state in QuestState::ALL {
            let raw: i32 = state.into();
            assert_eq!(QuestState::try_from(raw), Ok(state));
        }
        assert!(QuestState::try_from(9).is_err());
        assert!(StepState::try_from(-1).is_err());
    }

    #[test]
    fn test_step_walk() {
        let mut quest = QuestInstance::new(Arc::new(definition("q", 2, &[])), QuestState::CanStart);
        assert_eq!(quest.current_step(), None);
        assert!(!quest.current_step_exists());

        quest.begin();
        assert!(quest.is_in(QuestState::InProgress));
        assert_eq!(quest.current_step(), Some(0));
        assert!(quest.current_step_exists());

        assert!(quest.advance_step());
        assert_eq!(quest.current_step(), Some(1));

        assert!(!quest.advance_step());
        assert_eq!(quest.current_step(), None);
    }

    #[test]
    fn test_set_state_clears_index() {
        let mut quest = QuestInstance::new(Arc::new(definition("q", 1, &[])), QuestState::CanStart);
        quest.begin();
        quest.set_state(QuestState::CanFinish);
        assert_eq!(quest.current_step(), None);
    }

    #[test]
    fn test_step_state_out_of_range() {
        let mut quest = QuestInstance::new(Arc::new(definition("q", 2, &[])), QuestState::CanStart);
        assert!(quest.set_step_state(1, StepState::Running));
        assert!(!quest.set_step_state(2, StepState::Running));
        assert_eq!(quest.step_states().len(), 2);
    }

    #[test]
    fn test_restore_pads_and_clamps() {
        let def = Arc::new(definition("q", 3, &[]));
        let quest = QuestInstance::restore(
            def.clone(),
            QuestState::InProgress,
            Some(7),
            vec![StepState::Finished],
        );
        assert_eq!(
            quest.step_states(),
            &[StepState::Finished, StepState::NotStarted, StepState::NotStarted]
        );
        assert_eq!(quest.current_step(), Some(2));

        let quest = QuestInstance::restore(
            def,
            QuestState::CanFinish,
            Some(1),
            vec![StepState::Finished; 5],
        );
        assert_eq!(quest.step_states().len(), 3);
        assert_eq!(quest.current_step(), None);
    }

    #[test]
    fn test_rebind_keeps_progress() {
        let mut quest = QuestInstance::new(Arc::new(definition("q", 2, &[])), QuestState::CanStart);
        quest.begin();
        quest.set_step_state(0, StepState::Finished);
        quest.advance_step();

        quest.rebind(Arc::new(definition("q", 4, &[])));
        assert_eq!(quest.step_states().len(), 4);
        assert_eq!(quest.step_states()[0], StepState::Finished);
        assert_eq!(quest.current_step(), Some(1));
    }
}
