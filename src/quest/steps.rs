//! Quest Step Behaviours
//!
//! Each step kind builds a `StepController`. The `StepRunner` keeps the live
//! controller of every in-progress quest, feeds it world signals and queues
//! reports that the engine republishes on the bus.

use std::collections::{BTreeMap, HashMap};

use mlua::{Function, Lua, Value};
use thiserror::Error;
use tracing::{debug, error, warn};

use super::definition::{QuestDefinition, StepKind};
use super::state::StepState;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("step script '{0}' not loaded")]
    ScriptNotLoaded(String),
    #[error("script error: {0}")]
    Lua(#[from] mlua::Error),
}

/// Something that happened in the world that a step may care about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSignal {
    GoldGained(i32),
    ExperienceGained(i32),
    LevelReached(i32),
}

impl StepSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            StepSignal::GoldGained(_) => "gold",
            StepSignal::ExperienceGained(_) => "experience",
            StepSignal::LevelReached(_) => "level",
        }
    }

    pub fn amount(&self) -> i32 {
        match self {
            StepSignal::GoldGained(n) | StepSignal::ExperienceGained(n) | StepSignal::LevelReached(n) => *n,
        }
    }
}

/// What a controller sees when its step becomes active
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    /// State restored from a save, `NotStarted` for a fresh step
    pub saved: StepState,
    pub player_level: i32,
}

/// Runtime behaviour of one step
pub trait StepController {
    fn on_enter(&mut self, ctx: &StepContext);

    fn on_exit(&mut self) {}

    fn observe(&mut self, signal: &StepSignal);

    fn is_complete(&self) -> bool;
}

/// Completed only by external events
#[derive(Debug, Default)]
pub struct ManualStep;

impl StepController for ManualStep {
    fn on_enter(&mut self, _ctx: &StepContext) {}

    fn observe(&mut self, _signal: &StepSignal) {}

    fn is_complete(&self) -> bool {
        false
    }
}

/// Which signal a `CounterStep` accumulates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counted {
    Gold,
    Experience,
}

/// Accumulates gold or experience gained while active
#[derive(Debug)]
pub struct CounterStep {
    counted: Counted,
    current: i32,
    target: i32,
}

impl CounterStep {
    pub fn new(counted: Counted, target: i32) -> Self {
        Self {
            counted,
            current: 0,
            target,
        }
    }

    pub fn progress(&self) -> (i32, i32) {
        (self.current, self.target)
    }
}

impl StepController for CounterStep {
    fn on_enter(&mut self, _ctx: &StepContext) {
        // Counts are not persisted
        self.current = 0;
    }

    fn observe(&mut self, signal: &StepSignal) {
        let gained = match (self.counted, signal) {
            (Counted::Gold, StepSignal::GoldGained(n)) => *n,
            (Counted::Experience, StepSignal::ExperienceGained(n)) => *n,
            _ => return,
        };
        if gained > 0 {
            self.current = self.current.saturating_add(gained).min(self.target);
        }
    }

    fn is_complete(&self) -> bool {
        self.current >= self.target
    }
}

/// Completed once the player reaches a level
#[derive(Debug)]
pub struct LevelStep {
    required: i32,
    level: i32,
}

impl LevelStep {
    pub fn new(required: i32) -> Self {
        Self { required, level: 0 }
    }
}

impl StepController for LevelStep {
    fn on_enter(&mut self, ctx: &StepContext) {
        self.level = ctx.player_level;
    }

    fn observe(&mut self, signal: &StepSignal) {
        if let StepSignal::LevelReached(level) = signal {
            self.level = *level;
        }
    }

    fn is_complete(&self) -> bool {
        self.level >= self.required
    }
}

/// Step driven by a sandboxed Lua script.
///
/// The script may define `on_enter(level, saved)`, `on_signal(kind, amount)`
/// returning true once the step is done, and `on_exit()`. Script errors are
/// logged and leave the step incomplete.
pub struct ScriptedStep {
    name: String,
    lua: Lua,
    complete: bool,
}

impl ScriptedStep {
    pub fn new(name: &str, source: &str) -> Result<Self, StepError> {
        let lua = Lua::new();

        // Remove functions that reach outside the sandbox
        let globals = lua.globals();
        for global in ["os", "io", "loadfile", "dofile", "require"] {
            globals.set(global, Value::Nil)?;
        }

        lua.load(source).set_name(name).exec()?;

        Ok(Self {
            name: name.to_string(),
            lua,
            complete: false,
        })
    }

    fn function(&self, name: &str) -> Option<Function> {
        self.lua.globals().get::<Function>(name).ok()
    }
}

impl StepController for ScriptedStep {
    fn on_enter(&mut self, ctx: &StepContext) {
        self.complete = false;
        if let Some(on_enter) = self.function("on_enter") {
            let saved: i32 = ctx.saved.into();
            match on_enter.call::<Option<bool>>((ctx.player_level, saved)) {
                Ok(done) => self.complete |= done.unwrap_or(false),
                Err(e) => error!("Step script {} on_enter failed: {}", self.name, e),
            }
        }
    }

    fn on_exit(&mut self) {
        if let Some(on_exit) = self.function("on_exit") {
            if let Err(e) = on_exit.call::<()>(()) {
                error!("Step script {} on_exit failed: {}", self.name, e);
            }
        }
    }

    fn observe(&mut self, signal: &StepSignal) {
        if self.complete {
            return;
        }
        if let Some(on_signal) = self.function("on_signal") {
            match on_signal.call::<Option<bool>>((signal.kind(), signal.amount())) {
                Ok(done) => self.complete = done.unwrap_or(false),
                Err(e) => error!("Step script {} on_signal failed: {}", self.name, e),
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Build the controller for a step kind
pub fn build_controller(
    kind: &StepKind,
    scripts: &HashMap<String, String>,
) -> Result<Box<dyn StepController>, StepError> {
    let controller: Box<dyn StepController> = match kind {
        StepKind::Manual => Box::new(ManualStep),
        StepKind::CollectGold { amount } => Box::new(CounterStep::new(Counted::Gold, *amount)),
        StepKind::GainExperience { amount } => {
            Box::new(CounterStep::new(Counted::Experience, *amount))
        }
        StepKind::ReachLevel { level } => Box::new(LevelStep::new(*level)),
        StepKind::Script { script } => {
            let source = scripts
                .get(script)
                .ok_or_else(|| StepError::ScriptNotLoaded(script.clone()))?;
            Box::new(ScriptedStep::new(script, source)?)
        }
    };
    Ok(controller)
}

/// Output of the step runner, turned into bus events by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepReport {
    StateChanged {
        quest_id: String,
        step_index: usize,
        state: StepState,
    },
    Completed { quest_id: String, step_index: usize },
}

/// Collaborator that instantiates step behaviour for the engine
pub trait StepSpawner {
    /// Activate `step_index` of `quest`, replacing whatever step was live
    fn spawn(&mut self, quest: &QuestDefinition, step_index: usize, ctx: StepContext);

    /// Tear down the live step of a quest, if any
    fn despawn(&mut self, quest_id: &str);

    /// Index of the live step of a quest
    fn active_step(&self, quest_id: &str) -> Option<usize>;

    /// Forward a world signal to every live step
    fn observe(&mut self, signal: &StepSignal);

    /// Reports queued since the last call
    fn drain_reports(&mut self) -> Vec<StepReport>;

    /// Replace script sources after a reload
    fn set_scripts(&mut self, _scripts: HashMap<String, String>) {}
}

struct ActiveStep {
    step_index: usize,
    controller: Box<dyn StepController>,
    reported: StepState,
    completed: bool,
}

/// Default spawner running the built-in and scripted controllers
#[derive(Default)]
pub struct StepRunner {
    scripts: HashMap<String, String>,
    /// Ordered so reports for one signal come out by quest id
    active: BTreeMap<String, ActiveStep>,
    reports: Vec<StepReport>,
}

impl StepRunner {
    pub fn new(scripts: HashMap<String, String>) -> Self {
        Self {
            scripts,
            active: BTreeMap::new(),
            reports: Vec::new(),
        }
    }

    /// Queue reports for any change since the step was last checked
    fn check(reports: &mut Vec<StepReport>, quest_id: &str, step: &mut ActiveStep) {
        if step.completed {
            return;
        }
        let state = if step.controller.is_complete() {
            StepState::Finished
        } else {
            StepState::Running
        };

        if state != step.reported {
            step.reported = state;
            reports.push(StepReport::StateChanged {
                quest_id: quest_id.to_string(),
                step_index: step.step_index,
                state,
            });
        }

        if state == StepState::Finished {
            step.completed = true;
            reports.push(StepReport::Completed {
                quest_id: quest_id.to_string(),
                step_index: step.step_index,
            });
        }
    }
}

impl StepSpawner for StepRunner {
    fn spawn(&mut self, quest: &QuestDefinition, step_index: usize, ctx: StepContext) {
        self.despawn(&quest.id);

        let Some(step) = quest.steps.get(step_index) else {
            warn!("Quest {} has no step {}", quest.id, step_index);
            return;
        };

        let mut controller = match build_controller(&step.kind, &self.scripts) {
            Ok(controller) => controller,
            Err(e) => {
                error!("Failed to build step {} of quest {}: {}", step_index, quest.id, e);
                return;
            }
        };
        controller.on_enter(&ctx);
        debug!("Spawned {} step {} for quest {}", step.kind.name(), step_index, quest.id);

        let mut active = ActiveStep {
            step_index,
            controller,
            reported: ctx.saved,
            completed: false,
        };
        if ctx.saved == StepState::Finished {
            // Saved after the step finished but before the quest advanced
            active.completed = true;
            self.reports.push(StepReport::Completed {
                quest_id: quest.id.clone(),
                step_index,
            });
        } else {
            Self::check(&mut self.reports, &quest.id, &mut active);
        }
        self.active.insert(quest.id.clone(), active);
    }

    fn despawn(&mut self, quest_id: &str) {
        if let Some(mut step) = self.active.remove(quest_id) {
            step.controller.on_exit();
            debug!("Despawned step {} for quest {}", step.step_index, quest_id);
        }
    }

    fn active_step(&self, quest_id: &str) -> Option<usize> {
        self.active.get(quest_id).map(|step| step.step_index)
    }

    fn observe(&mut self, signal: &StepSignal) {
        for (quest_id, step) in self.active.iter_mut() {
            if step.completed {
                continue;
            }
            step.controller.observe(signal);
            Self::check(&mut self.reports, quest_id, step);
        }
    }

    fn drain_reports(&mut self) -> Vec<StepReport> {
        std::mem::take(&mut self.reports)
    }

    /// Applies to steps spawned from now on
    fn set_scripts(&mut self, scripts: HashMap<String, String>) {
        self.scripts = scripts;
    }
}
