//! Quest System Module
//!
//! Event-driven quest progression: TOML definitions, per-quest state
//! machines, step behaviours (built-in kinds plus sandboxed Lua) and
//! key-value persistence of progress.

pub mod definition;
pub mod registry;
pub mod state;
pub mod events;
pub mod steps;
pub mod persistence;
pub mod engine;
pub mod service;

pub use definition::{DefinitionError, QuestDefinition, Reward, StepDefinition, StepKind};
pub use registry::{DefinitionSource, HotReloadEvent, QuestRegistry};
pub use state::{QuestInstance, QuestSnapshot, QuestState, StepState};
pub use events::{PlayerEvent, QuestEvent, RewardEvent};
pub use steps::{StepRunner, StepSignal, StepSpawner};
pub use persistence::{MemoryStore, QuestStore, SavedQuest, StoreError};
pub use engine::{EngineError, EngineOptions, QuestEngine, SaveReport};
pub use service::QuestService;
