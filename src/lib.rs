//! Quest progression engine.
//!
//! Tracks authored quests through their lifecycle, reacts to gameplay
//! events published on an in-process bus and persists progress so a session
//! can resume where it stopped.

pub mod bus;
pub mod config;
pub mod db;
pub mod progression;
pub mod quest;

pub use bus::{EventBus, Subscription, TopicKind};
pub use config::EngineConfig;
pub use progression::{PlayerStats, Progression};
pub use quest::{QuestEngine, QuestService};
