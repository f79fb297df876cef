//! Quest Event Types
//!
//! Payloads carried by the three bus topics: quest lifecycle, player
//! progression and rewards.

use serde::{Deserialize, Serialize};

use super::state::{QuestSnapshot, StepState};

/// Quest lifecycle topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QuestEvent {
    /// Request to accept a quest (usually from dialogue)
    StartQuest { quest_id: String },
    /// Request to move a quest to its next step
    AdvanceQuest { quest_id: String },
    /// Request to turn a quest in
    FinishQuest { quest_id: String },
    /// A step reported a new state
    StepStateChanged {
        quest_id: String,
        step_index: usize,
        state: StepState,
    },
    /// Published by the engine after any change to a quest
    QuestStateChanged(QuestSnapshot),
}

impl QuestEvent {
    /// Quest this event refers to
    pub fn quest_id(&self) -> &str {
        match self {
            QuestEvent::StartQuest { quest_id }
            | QuestEvent::AdvanceQuest { quest_id }
            | QuestEvent::FinishQuest { quest_id }
            | QuestEvent::StepStateChanged { quest_id, .. } => quest_id,
            QuestEvent::QuestStateChanged(snapshot) => &snapshot.quest_id,
        }
    }

    /// Get event type as string (for logging/debugging)
    pub fn event_type(&self) -> &'static str {
        match self {
            QuestEvent::StartQuest { .. } => "start_quest",
            QuestEvent::AdvanceQuest { .. } => "advance_quest",
            QuestEvent::FinishQuest { .. } => "finish_quest",
            QuestEvent::StepStateChanged { .. } => "step_state_changed",
            QuestEvent::QuestStateChanged(_) => "quest_state_changed",
        }
    }

    /// Whether the engine consumes this event
    pub fn is_inbound(&self) -> bool {
        !matches!(self, QuestEvent::QuestStateChanged(_))
    }
}

/// Player progression topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerEvent {
    LevelChanged { level: i32 },
    ExperienceChanged { experience: i32 },
}

impl PlayerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            PlayerEvent::LevelChanged { .. } => "level_changed",
            PlayerEvent::ExperienceChanged { .. } => "experience_changed",
        }
    }
}

/// Reward topic, consumed by the economy and progression listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardEvent {
    GoldGranted { amount: i32 },
    ExperienceGranted { amount: i32 },
}

impl RewardEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            RewardEvent::GoldGranted { .. } => "gold_granted",
            RewardEvent::ExperienceGranted { .. } => "experience_granted",
        }
    }
}
