//! Quest Engine
//!
//! Single owner of every quest instance. Applies lifecycle transitions,
//! evaluates requirements, drives step behaviour through a `StepSpawner` and
//! persists through a `QuestStore`.
//!
//! The engine never publishes directly. Every outbound event is queued and
//! handed to the caller through `drain_outbox`, so the engine is never
//! borrowed while listeners run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::definition::{DefinitionError, QuestDefinition, StepDefinition};
use super::events::{QuestEvent, RewardEvent};
use super::persistence::{QuestStore, SavedQuest};
use super::registry::validate_definitions;
use super::state::{QuestInstance, QuestSnapshot, QuestState, StepState};
use super::steps::{StepContext, StepReport, StepSignal, StepSpawner};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("unknown quest '{0}'")]
    UnknownQuest(String),
    #[error("quest '{quest_id}' cannot {action} while {state}")]
    InvalidTransition {
        quest_id: String,
        action: &'static str,
        state: QuestState,
    },
    #[error("quest '{quest_id}' has no step {step_index}")]
    StepOutOfRange { quest_id: String, step_index: usize },
    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

/// Event produced by the engine, published by whoever owns it
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Quest(QuestEvent),
    Reward(RewardEvent),
}

/// Result of a bulk save
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub saved: usize,
    pub failed: Vec<String>,
}

/// Engine settings taken from the host configuration
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Restore saved progress at startup
    pub load_saved_state: bool,
    /// Persist a quest after every transition
    pub save_on_transition: bool,
    /// Player level assumed until the first level event arrives
    pub player_level: i32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            load_saved_state: true,
            save_on_transition: true,
            player_level: 1,
        }
    }
}

pub struct QuestEngine {
    /// Quest id -> instance, ordered for deterministic ticks and saves
    quests: BTreeMap<String, QuestInstance>,
    player_level: i32,
    options: EngineOptions,
    store: Box<dyn QuestStore>,
    steps: Box<dyn StepSpawner>,
    outbox: Vec<Outbound>,
}

impl QuestEngine {
    /// Build one instance per definition, restoring saved progress where the
    /// store has a readable entry. Duplicate ids and unknown prerequisites
    /// are rejected.
    pub fn new(
        definitions: Vec<QuestDefinition>,
        store: Box<dyn QuestStore>,
        steps: Box<dyn StepSpawner>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        validate_definitions(&definitions)?;

        let mut engine = Self {
            quests: BTreeMap::new(),
            player_level: options.player_level,
            options,
            store,
            steps,
            outbox: Vec::new(),
        };

        for definition in definitions {
            let quest = engine.load_quest(Arc::new(definition));
            engine.quests.insert(quest.id().to_string(), quest);
        }

        info!("Quest engine ready with {} quests", engine.quests.len());
        Ok(engine)
    }

    fn fresh_quest(&self, definition: Arc<QuestDefinition>) -> QuestInstance {
        let state = if !definition.has_prerequisites()
            && self.level_requirement_met(definition.level_required)
        {
            QuestState::CanStart
        } else {
            QuestState::RequirementsNotMet
        };
        QuestInstance::new(definition, state)
    }

    /// Restore a quest from the store, falling back to a fresh instance
    fn load_quest(&self, definition: Arc<QuestDefinition>) -> QuestInstance {
        if !self.options.load_saved_state {
            return self.fresh_quest(definition);
        }

        let payload = match self.store.get(&definition.id) {
            Ok(Some(payload)) => payload,
            Ok(None) => return self.fresh_quest(definition),
            Err(e) => {
                warn!("Failed to read saved state for quest {}: {}", definition.id, e);
                return self.fresh_quest(definition);
            }
        };

        match SavedQuest::from_json(&payload) {
            Ok(saved) => {
                let quest = saved.into_instance(definition);
                debug!("Restored quest {} as {}", quest.id(), quest.state());
                quest
            }
            Err(e) => {
                warn!("Discarding saved state for quest {}: {}", definition.id, e);
                self.fresh_quest(definition)
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_quest_state(&self, quest_id: &str) -> Option<QuestState> {
        self.quests.get(quest_id).map(|q| q.state())
    }

    pub fn level_requirement_met(&self, required_level: i32) -> bool {
        self.player_level >= required_level
    }

    pub fn player_level(&self) -> i32 {
        self.player_level
    }

    pub fn quest(&self, quest_id: &str) -> Option<&QuestInstance> {
        self.quests.get(quest_id)
    }

    pub fn snapshot(&self, quest_id: &str) -> Option<QuestSnapshot> {
        self.quests.get(quest_id).map(|q| q.snapshot())
    }

    pub fn snapshots(&self) -> Vec<QuestSnapshot> {
        self.quests.values().map(|q| q.snapshot()).collect()
    }

    /// Whether level and prerequisites allow the quest to be offered
    pub fn requirements_met(&self, quest: &QuestInstance) -> bool {
        let definition = quest.definition();
        if !self.level_requirement_met(definition.level_required) {
            return false;
        }
        definition.prerequisites.iter().all(|id| {
            self.quests
                .get(id)
                .is_some_and(|prerequisite| prerequisite.is_in(QuestState::Finished))
        })
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Spawn live steps for restored in-progress quests and announce the
    /// state of every quest.
    pub fn startup(&mut self) {
        let in_progress: Vec<(Arc<QuestDefinition>, usize, StepState)> = self
            .quests
            .values()
            .filter(|q| q.is_in(QuestState::InProgress))
            .filter_map(|q| {
                let index = q.current_step()?;
                Some((q.definition().clone(), index, q.step_states()[index]))
            })
            .collect();

        for (definition, index, saved) in in_progress {
            let ctx = StepContext {
                saved,
                player_level: self.player_level,
            };
            self.steps.spawn(&definition, index, ctx);
        }

        let snapshots = self.snapshots();
        for snapshot in snapshots {
            self.outbox.push(Outbound::Quest(QuestEvent::QuestStateChanged(snapshot)));
        }
        self.collect_step_reports();
    }

    /// Promote every quest whose requirements are now satisfied
    pub fn tick(&mut self) {
        let ready: Vec<String> = self
            .quests
            .values()
            .filter(|q| q.is_in(QuestState::RequirementsNotMet) && self.requirements_met(q))
            .map(|q| q.id().to_string())
            .collect();

        for quest_id in ready {
            info!("Quest {} can now be started", quest_id);
            self.change_state(&quest_id, QuestState::CanStart);
        }
    }

    pub fn start_quest(&mut self, quest_id: &str) -> Result<(), EngineError> {
        let quest = self.quest_mut(quest_id)?;
        if !quest.is_in(QuestState::CanStart) {
            return Err(invalid(quest, "start"));
        }

        info!("Start quest: {}", quest_id);
        quest.begin();
        quest.started_at = Some(Utc::now());
        self.spawn_current_step(quest_id);
        self.committed(quest_id);
        Ok(())
    }

    pub fn advance_quest(&mut self, quest_id: &str) -> Result<(), EngineError> {
        let quest = self.quest_mut(quest_id)?;
        if !quest.is_in(QuestState::InProgress) {
            return Err(invalid(quest, "advance"));
        }

        info!("Advance quest: {}", quest_id);
        if quest.advance_step() {
            self.spawn_current_step(quest_id);
        } else {
            quest.set_state(QuestState::CanFinish);
            self.steps.despawn(quest_id);
        }
        self.committed(quest_id);
        Ok(())
    }

    /// Grant rewards and close the quest. Only accepted from `CanFinish`, so
    /// a repeated finish never grants twice.
    pub fn finish_quest(&mut self, quest_id: &str) -> Result<(), EngineError> {
        let quest = self.quest_mut(quest_id)?;
        if !quest.is_in(QuestState::CanFinish) {
            return Err(invalid(quest, "finish"));
        }

        info!("Finish quest: {}", quest_id);
        let rewards = quest.definition().rewards;
        self.outbox.push(Outbound::Reward(RewardEvent::GoldGranted { amount: rewards.gold }));
        self.outbox.push(Outbound::Reward(RewardEvent::ExperienceGranted { amount: rewards.exp }));

        let quest = self.quest_mut(quest_id)?;
        quest.set_state(QuestState::Finished);
        quest.finished_at = Some(Utc::now());
        self.committed(quest_id);
        Ok(())
    }

    /// Record a step state and republish the quest
    pub fn on_step_state_change(
        &mut self,
        quest_id: &str,
        step_index: usize,
        state: StepState,
    ) -> Result<(), EngineError> {
        let quest = self.quest_mut(quest_id)?;
        if !quest.set_step_state(step_index, state) {
            return Err(EngineError::StepOutOfRange {
                quest_id: quest_id.to_string(),
                step_index,
            });
        }

        debug!("Quest {} step {} is now {}", quest_id, step_index, state);
        self.committed(quest_id);
        Ok(())
    }

    pub fn on_player_level_change(&mut self, level: i32) {
        debug!("Player level changed to {}", level);
        self.player_level = level;
        self.observe(&StepSignal::LevelReached(level));
    }

    /// Forward a world signal to live steps
    pub fn observe(&mut self, signal: &StepSignal) {
        self.steps.observe(signal);
        self.collect_step_reports();
    }

    /// Dispatch one inbound quest event
    pub fn handle(&mut self, event: &QuestEvent) -> Result<(), EngineError> {
        match event {
            QuestEvent::StartQuest { quest_id } => self.start_quest(quest_id),
            QuestEvent::AdvanceQuest { quest_id } => self.advance_quest(quest_id),
            QuestEvent::FinishQuest { quest_id } => self.finish_quest(quest_id),
            QuestEvent::StepStateChanged {
                quest_id,
                step_index,
                state,
            } => self.on_step_state_change(quest_id, *step_index, *state),
            QuestEvent::QuestStateChanged(_) => Ok(()),
        }
    }

    /// Events queued since the last call
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write one quest to the store. A store failure is logged, not returned.
    pub fn save_quest(&mut self, quest_id: &str) -> Result<(), EngineError> {
        if !self.quests.contains_key(quest_id) {
            return Err(EngineError::UnknownQuest(quest_id.to_string()));
        }
        if let Err(e) = self.write_quest(quest_id) {
            error!("Failed to save quest {}: {}", quest_id, e);
        }
        Ok(())
    }

    /// Write every quest; a failing quest does not stop the others
    pub fn save_all(&mut self) -> SaveReport {
        let mut report = SaveReport::default();
        let ids: Vec<String> = self.quests.keys().cloned().collect();

        for quest_id in ids {
            match self.write_quest(&quest_id) {
                Ok(()) => report.saved += 1,
                Err(e) => {
                    error!("Failed to save quest {}: {}", quest_id, e);
                    report.failed.push(quest_id);
                }
            }
        }

        info!("Saved {} quests ({} failed)", report.saved, report.failed.len());
        report
    }

    fn write_quest(&mut self, quest_id: &str) -> Result<(), String> {
        let Some(quest) = self.quests.get(quest_id) else {
            return Ok(());
        };
        let payload = SavedQuest::capture(quest).to_json().map_err(|e| e.to_string())?;
        self.store.put(quest_id, payload).map_err(|e| e.to_string())
    }

    pub fn store_mut(&mut self) -> &mut dyn QuestStore {
        self.store.as_mut()
    }

    /// Swap in reloaded definitions and step scripts. Existing quests keep
    /// their progress fitted to the new step list, new ids start fresh and
    /// removed ids are dropped. On error the current set stays in place.
    pub fn reload_definitions(
        &mut self,
        definitions: Vec<QuestDefinition>,
        scripts: HashMap<String, String>,
    ) -> Result<(), EngineError> {
        validate_definitions(&definitions)?;
        self.steps.set_scripts(scripts);

        let live_steps: HashMap<String, (usize, StepDefinition)> = self
            .quests
            .values()
            .filter(|q| q.is_in(QuestState::InProgress))
            .filter_map(|q| {
                let index = q.current_step()?;
                let step = q.definition().steps.get(index)?.clone();
                Some((q.id().to_string(), (index, step)))
            })
            .collect();

        let mut previous: HashMap<String, QuestInstance> =
            std::mem::take(&mut self.quests).into_iter().collect();

        for definition in definitions {
            let definition = Arc::new(definition);
            let quest = match previous.remove(&definition.id) {
                Some(mut quest) => {
                    quest.rebind(definition);
                    quest
                }
                None => {
                    info!("New quest {} added by reload", definition.id);
                    self.fresh_quest(definition)
                }
            };
            self.quests.insert(quest.id().to_string(), quest);
        }

        for quest_id in previous.keys() {
            warn!("Quest {} removed by reload", quest_id);
            self.steps.despawn(quest_id);
        }

        // Live controllers keep their progress unless their step changed
        let changed: Vec<String> = self
            .quests
            .values()
            .filter(|q| q.is_in(QuestState::InProgress))
            .filter(|q| {
                let Some(index) = q.current_step() else {
                    return false;
                };
                let unchanged = live_steps.get(q.id()).is_some_and(|(live_index, live_step)| {
                    *live_index == index && q.definition().steps.get(index) == Some(live_step)
                });
                !unchanged || self.steps.active_step(q.id()) != Some(index)
            })
            .map(|q| q.id().to_string())
            .collect();
        for quest_id in changed {
            debug!("Respawning step of quest {} after reload", quest_id);
            self.spawn_current_step(&quest_id);
        }
        self.collect_step_reports();

        let snapshots = self.snapshots();
        for snapshot in snapshots {
            self.outbox.push(Outbound::Quest(QuestEvent::QuestStateChanged(snapshot)));
        }
        info!("Reloaded {} quest definitions", self.quests.len());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn quest_mut(&mut self, quest_id: &str) -> Result<&mut QuestInstance, EngineError> {
        self.quests
            .get_mut(quest_id)
            .ok_or_else(|| EngineError::UnknownQuest(quest_id.to_string()))
    }

    fn change_state(&mut self, quest_id: &str, state: QuestState) {
        if let Some(quest) = self.quests.get_mut(quest_id) {
            quest.set_state(state);
            self.committed(quest_id);
        }
    }

    fn spawn_current_step(&mut self, quest_id: &str) {
        let Some(quest) = self.quests.get(quest_id) else {
            return;
        };
        let Some(index) = quest.current_step() else {
            return;
        };
        let definition = quest.definition().clone();
        let ctx = StepContext {
            saved: quest.step_states()[index],
            player_level: self.player_level,
        };
        self.steps.spawn(&definition, index, ctx);
    }

    /// Publish the new state, persist it and pick up step reports
    fn committed(&mut self, quest_id: &str) {
        if let Some(snapshot) = self.snapshot(quest_id) {
            self.outbox.push(Outbound::Quest(QuestEvent::QuestStateChanged(snapshot)));
        }
        if self.options.save_on_transition {
            let _ = self.save_quest(quest_id);
        }
        self.collect_step_reports();
    }

    fn collect_step_reports(&mut self) {
        for report in self.steps.drain_reports() {
            let event = match report {
                StepReport::StateChanged {
                    quest_id,
                    step_index,
                    state,
                } => QuestEvent::StepStateChanged {
                    quest_id,
                    step_index,
                    state,
                },
                StepReport::Completed { quest_id, .. } => QuestEvent::AdvanceQuest { quest_id },
            };
            self.outbox.push(Outbound::Quest(event));
        }
    }
}

fn invalid(quest: &QuestInstance, action: &'static str) -> EngineError {
    EngineError::InvalidTransition {
        quest_id: quest.id().to_string(),
        action,
        state: quest.state(),
    }
}
