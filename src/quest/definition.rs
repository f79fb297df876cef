//! Quest Definition Structures
//!
//! These structures are deserialized from TOML quest files and resolved into
//! immutable definitions shared by every quest instance.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating authored quests
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("quest '{quest}' step {index}: unknown step kind '{kind}'")]
    UnknownStepKind { quest: String, index: usize, kind: String },
    #[error("quest '{quest}' step {index}: missing '{field}' for kind '{kind}'")]
    MissingStepField {
        quest: String,
        index: usize,
        kind: String,
        field: &'static str,
    },
    #[error("quest '{0}' has no steps")]
    NoSteps(String),
    #[error("duplicate quest id '{0}'")]
    DuplicateId(String),
    #[error("quest '{quest}' requires unknown quest '{prerequisite}'")]
    UnknownPrerequisite { quest: String, prerequisite: String },
    #[error("quest '{0}' lists itself as a prerequisite")]
    SelfPrerequisite(String),
    #[error("prerequisite cycle: {}", .0.join(" -> "))]
    PrerequisiteCycle(Vec<String>),
    #[error("quest '{quest}' uses missing step script '{script}'")]
    MissingScript { quest: String, script: String },
}

/// A quest definition loaded from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct RawQuestFile {
    pub quest: RawQuest,
}

/// Raw quest data as it appears in TOML
#[derive(Debug, Clone, Deserialize)]
pub struct RawQuest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub level_required: i32,
    /// Quests that must be finished first
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub steps: Vec<RawStep>,
    #[serde(default)]
    pub rewards: Option<RawReward>,
}

/// Raw step as it appears in TOML
#[derive(Debug, Clone, Deserialize)]
pub struct RawStep {
    pub kind: String,
    #[serde(default)]
    pub description: String,
    pub amount: Option<i32>,
    pub level: Option<i32>,
    pub script: Option<String>,
}

/// Raw reward as it appears in TOML
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawReward {
    #[serde(default)]
    pub exp: i32,
    #[serde(default)]
    pub gold: i32,
}

// ============================================================================
// Resolved Quest Structures (after parsing)
// ============================================================================

/// Behaviour attached to a quest step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StepKind {
    /// Driven entirely by external step-state and advance events
    Manual,
    /// Gain this much gold while the step is active
    CollectGold { amount: i32 },
    /// Gain this much experience while the step is active
    GainExperience { amount: i32 },
    /// Reach a player level
    ReachLevel { level: i32 },
    /// Lua script under `scripts/steps`
    Script { script: String },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Manual => "manual",
            StepKind::CollectGold { .. } => "collect_gold",
            StepKind::GainExperience { .. } => "gain_experience",
            StepKind::ReachLevel { .. } => "reach_level",
            StepKind::Script { .. } => "script",
        }
    }
}

/// A resolved quest step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepDefinition {
    pub kind: StepKind,
    pub description: String,
}

impl StepDefinition {
    pub fn from_raw(quest_id: &str, index: usize, raw: &RawStep) -> Result<Self, DefinitionError> {
        let missing = |field| DefinitionError::MissingStepField {
            quest: quest_id.to_string(),
            index,
            kind: raw.kind.clone(),
            field,
        };

        let kind = match raw.kind.to_lowercase().as_str() {
            "manual" => StepKind::Manual,
            "collect_gold" | "gold" => StepKind::CollectGold {
                amount: raw.amount.ok_or_else(|| missing("amount"))?,
            },
            "gain_experience" | "experience" | "exp" => StepKind::GainExperience {
                amount: raw.amount.ok_or_else(|| missing("amount"))?,
            },
            "reach_level" | "level" => StepKind::ReachLevel {
                level: raw.level.ok_or_else(|| missing("level"))?,
            },
            "script" => StepKind::Script {
                script: raw.script.clone().ok_or_else(|| missing("script"))?,
            },
            other => {
                return Err(DefinitionError::UnknownStepKind {
                    quest: quest_id.to_string(),
                    index,
                    kind: other.to_string(),
                })
            }
        };

        Ok(Self {
            kind,
            description: raw.description.clone(),
        })
    }
}

/// Quest rewards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Reward {
    pub exp: i32,
    pub gold: i32,
}

impl Reward {
    pub fn from_raw(raw: &RawReward) -> Self {
        Self {
            exp: raw.exp,
            gold: raw.gold,
        }
    }
}

/// A fully resolved quest definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Minimum player level required
    pub level_required: i32,
    /// Quest ids that must be finished first
    pub prerequisites: Vec<String>,
    pub steps: Vec<StepDefinition>,
    pub rewards: Reward,
}

impl QuestDefinition {
    /// Create a QuestDefinition from raw TOML data
    pub fn from_raw(raw: &RawQuest) -> Result<Self, DefinitionError> {
        let steps = raw
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| StepDefinition::from_raw(&raw.id, i, s))
            .collect::<Result<Vec<_>, _>>()?;

        if steps.is_empty() {
            return Err(DefinitionError::NoSteps(raw.id.clone()));
        }

        if raw.prerequisites.iter().any(|p| *p == raw.id) {
            return Err(DefinitionError::SelfPrerequisite(raw.id.clone()));
        }

        Ok(Self {
            id: raw.id.clone(),
            name: raw.name.clone(),
            description: raw.description.clone(),
            level_required: raw.level_required,
            prerequisites: raw.prerequisites.clone(),
            steps,
            rewards: raw.rewards.as_ref().map(Reward::from_raw).unwrap_or_default(),
        })
    }

    /// Parse a single TOML quest file body
    pub fn from_toml(path: &str, content: &str) -> Result<Self, DefinitionError> {
        let raw: RawQuestFile = toml::from_str(content).map_err(|e| DefinitionError::Parse {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_raw(&raw.quest)
    }

    pub fn has_prerequisites(&self) -> bool {
        !self.prerequisites.is_empty()
    }

    /// Script paths referenced by this quest's steps
    pub fn scripts(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|s| match &s.kind {
            StepKind::Script { script } => Some(script.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Manual-step definition used across the quest module tests
    pub(crate) fn definition(id: &str, steps: usize, prerequisites: &[&str]) -> QuestDefinition {
        QuestDefinition {
            id: id.to_string(),
            name: format!("Quest {}", id),
            description: String::new(),
            level_required: 1,
            prerequisites: prerequisites.iter().map(|p| p.to_string()).collect(),
            steps: (0..steps)
                .map(|i| StepDefinition {
                    kind: StepKind::Manual,
                    description: format!("step {}", i),
                })
                .collect(),
            rewards: Reward { exp: 50, gold: 10 },
        }
    }

    #[test]
    fn test_parse_quest_file() {
        let toml_str = r#"
[quest]
id = "collect_coins"
name = "Collect Coins"
level_required = 2
prerequisites = ["intro"]

[quest.rewards]
gold = 10
exp = 50

[[quest.steps]]
kind = "collect_gold"
amount = 5
description = "Collect 5 gold"

[[quest.steps]]
kind = "manual"
description = "Return to the merchant"
"#;
        let quest = QuestDefinition::from_toml("collect_coins.toml", toml_str).unwrap();
        assert_eq!(quest.id, "collect_coins");
        assert_eq!(quest.level_required, 2);
        assert_eq!(quest.prerequisites, vec!["intro".to_string()]);
        assert_eq!(quest.steps.len(), 2);
        assert_eq!(quest.steps[0].kind, StepKind::CollectGold { amount: 5 });
        assert_eq!(quest.rewards, Reward { exp: 50, gold: 10 });
    }

    #[test]
    fn test_step_kind_parsing() {
        let raw = |kind: &str| RawStep {
            kind: kind.to_string(),
            description: String::new(),
            amount: Some(3),
            level: Some(4),
            script: Some("boss.lua".to_string()),
        };
        let kind = |k: &str| StepDefinition::from_raw("q", 0, &raw(k)).map(|s| s.kind);

        assert_eq!(kind("manual"), Ok(StepKind::Manual));
        assert_eq!(kind("exp"), Ok(StepKind::GainExperience { amount: 3 }));
        assert_eq!(kind("reach_level"), Ok(StepKind::ReachLevel { level: 4 }));
        assert_eq!(
            kind("script"),
            Ok(StepKind::Script { script: "boss.lua".to_string() })
        );
        assert!(matches!(
            kind("dance"),
            Err(DefinitionError::UnknownStepKind { .. })
        ));
    }

    #[test]
    fn test_missing_step_field() {
        let raw = RawStep {
            kind: "collect_gold".to_string(),
            description: String::new(),
            amount: None,
            level: None,
            script: None,
        };
        assert!(matches!(
            StepDefinition::from_raw("q", 1, &raw),
            Err(DefinitionError::MissingStepField { field: "amount", index: 1, .. })
        ));
    }

    #[test]
    fn test_rejects_empty_and_self_referencing() {
        let empty = "[quest]\nid = \"a\"\nname = \"A\"\n";
        assert_eq!(
            QuestDefinition::from_toml("a.toml", empty),
            Err(DefinitionError::NoSteps("a".to_string()))
        );

        let looped = r#"
[quest]
id = "a"
name = "A"
prerequisites = ["a"]
[[quest.steps]]
kind = "manual"
"#;
        assert_eq!(
            QuestDefinition::from_toml("a.toml", looped),
            Err(DefinitionError::SelfPrerequisite("a".to_string()))
        );
    }
}
