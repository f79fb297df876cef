use std::collections::HashMap;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, Instant};
use tracing::{error, info, warn};

use quest_engine::bus::EventBus;
use quest_engine::config::EngineConfig;
use quest_engine::db::Database;
use quest_engine::progression::{PlayerStats, Progression};
use quest_engine::quest::{
    DefinitionSource, HotReloadEvent, MemoryStore, QuestEngine, QuestEvent, QuestRegistry,
    QuestService, RewardEvent, StepRunner, StepState,
};

// ============================================================================
// Console Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Start(String),
    Advance(String),
    Finish(String),
    Step {
        quest_id: String,
        step_index: usize,
        state: StepState,
    },
    Gold(i32),
    Xp(i32),
    Level(i32),
    Status,
    Help,
    Quit,
}

const HELP: &str = "commands: start <id> | advance <id> | finish <id> | step <id> <index> <state> | gold <n> | xp <n> | level <n> | status | quit";

impl Command {
    fn parse(line: &str) -> Result<Self, String> {
        fn number(raw: &str) -> Result<i32, String> {
            raw.parse().map_err(|_| format!("not a number: {}", raw))
        }

        let parts: Vec<&str> = line.split_whitespace().collect();

        match parts.as_slice() {
            ["start", id] => Ok(Command::Start(id.to_string())),
            ["advance", id] => Ok(Command::Advance(id.to_string())),
            ["finish", id] => Ok(Command::Finish(id.to_string())),
            ["step", id, index, state] => Ok(Command::Step {
                quest_id: id.to_string(),
                step_index: index
                    .parse::<usize>()
                    .map_err(|_| format!("not a step index: {}", index))?,
                state: StepState::from_str(state).ok_or_else(|| format!("unknown step state: {}", state))?,
            }),
            ["gold", n] => Ok(Command::Gold(number(n)?)),
            ["xp", n] => Ok(Command::Xp(number(n)?)),
            ["level", n] => Ok(Command::Level(number(n)?)),
            ["status"] => Ok(Command::Status),
            ["help"] => Ok(Command::Help),
            ["quit"] | ["exit"] => Ok(Command::Quit),
            _ => Err(format!("unrecognised command '{}'", line.trim())),
        }
    }
}

/// Session state the console talks to
struct Host {
    bus: EventBus,
    quests: QuestService,
    progression: Progression,
    registry: QuestRegistry,
    db: Database,
}

impl Host {
    /// Returns false once the session should end
    fn execute(&self, command: Command) -> bool {
        match command {
            Command::Start(quest_id) => self.bus.publish(QuestEvent::StartQuest { quest_id }),
            Command::Advance(quest_id) => self.bus.publish(QuestEvent::AdvanceQuest { quest_id }),
            Command::Finish(quest_id) => self.bus.publish(QuestEvent::FinishQuest { quest_id }),
            Command::Step {
                quest_id,
                step_index,
                state,
            } => self.bus.publish(QuestEvent::StepStateChanged {
                quest_id,
                step_index,
                state,
            }),
            Command::Gold(amount) => self.bus.publish(RewardEvent::GoldGranted { amount }),
            Command::Xp(amount) => self.bus.publish(RewardEvent::ExperienceGranted { amount }),
            Command::Level(level) => self.progression.set_level(level),
            Command::Status => self.print_status(),
            Command::Help => println!("{}", HELP),
            Command::Quit => return false,
        }
        true
    }

    fn print_status(&self) {
        {
            let stats = self.progression.stats();
            println!(
                "level {} ({}/{} xp), {} gold, {} stat points",
                stats.level(),
                stats.experience(),
                stats.max_experience(),
                stats.gold(),
                stats.stat_points()
            );
        }
        for quest in self.quests.snapshots() {
            let step = quest
                .current_step
                .map_or_else(|| "-".to_string(), |index| (index + 1).to_string());
            println!(
                "  {:<24} {:<22} step {} ({}/{} finished)",
                quest.quest_id,
                quest.state.as_str(),
                step,
                quest.finished_steps(),
                quest.step_states.len()
            );
        }
    }

    /// Write dirty store entries to SQLite; failed keys are retried next time
    async fn flush(&self) {
        let writes = self.quests.drain_store_writes();
        if writes.is_empty() {
            return;
        }
        for quest_id in self.db.save_entries(&writes).await {
            self.quests.mark_dirty(&quest_id);
        }
    }

    fn reload(&mut self, path: &str) {
        info!("Quest hot-reload: {}", path);
        let definitions = match self.registry.load_definitions() {
            Ok(definitions) => definitions,
            Err(e) => {
                error!("Quest hot-reload error: {}", e);
                return;
            }
        };
        let scripts = self.registry.scripts().clone();
        if let Err(e) = self.quests.reload_definitions(definitions, scripts) {
            error!("Quest hot-reload rejected: {}", e);
        }
    }
}

async fn next_reload(rx: &mut Option<mpsc::Receiver<HotReloadEvent>>) -> Option<HotReloadEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("quest_engine=info".parse()?),
        )
        .init();

    let config = EngineConfig::from_env()?;

    // Load quest definitions from TOML files
    let mut registry = QuestRegistry::new(&config.data_dir);
    let definitions = registry
        .load_definitions()
        .context("Failed to load quest definitions")?;

    // Seed the write-behind store from the database
    let db = Database::new(&config.database_url)
        .await
        .context("Failed to initialize database")?;
    let saved = if config.load_saved_state {
        db.load_all().await.context("Failed to read saved quests")?
    } else {
        HashMap::new()
    };
    info!("Loaded {} saved quest entries", saved.len());

    let engine = QuestEngine::new(
        definitions,
        Box::new(MemoryStore::with_entries(saved)),
        Box::new(StepRunner::new(registry.scripts().clone())),
        config.engine_options(),
    )?;

    let bus = EventBus::new();
    let quests = QuestService::attach(engine, &bus);
    let progression = Progression::attach(
        PlayerStats::new(config.starting_level, config.starting_max_experience),
        &bus,
    );
    bus.subscribe(|event: &QuestEvent| {
        if let QuestEvent::QuestStateChanged(quest) = event {
            info!("Quest {} is {}", quest.quest_id, quest.state);
        }
    });

    // Start hot-reload watcher for quest files (dev mode)
    let mut reload_rx = if cfg!(debug_assertions) && config.hot_reload {
        match registry.start_file_watcher() {
            Ok(rx) => {
                info!("Quest hot-reload enabled");
                Some(rx)
            }
            Err(e) => {
                warn!("Failed to start quest hot-reload: {}", e);
                None
            }
        }
    } else {
        None
    };

    let mut host = Host {
        bus,
        quests,
        progression,
        registry,
        db,
    };

    host.progression.announce();
    host.quests.startup();
    println!("{}", HELP);

    let mut tick = interval(config.tick_interval());
    let autosave_every = config.autosave_interval();
    let mut autosave = interval_at(Instant::now() + autosave_every, autosave_every);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tick.tick() => {
                host.quests.tick();
                host.flush().await;
            }
            _ = autosave.tick() => {
                let report = host.quests.save_all();
                if !report.failed.is_empty() {
                    warn!("Auto-save failed for {:?}", report.failed);
                }
                host.flush().await;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match Command::parse(&line) {
                    Ok(command) => {
                        if !host.execute(command) {
                            break;
                        }
                        host.flush().await;
                    }
                    Err(e) => println!("{}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            Some(HotReloadEvent::Changed(path)) = next_reload(&mut reload_rx) => {
                host.reload(&path);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    // Save everything on exit
    let report = host.quests.save_all();
    host.flush().await;
    info!("Shutdown complete, {} quests saved", report.saved);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("start intro"), Ok(Command::Start("intro".to_string())));
        assert_eq!(Command::parse("  finish   intro "), Ok(Command::Finish("intro".to_string())));
        assert_eq!(
            Command::parse("step intro 1 finished"),
            Ok(Command::Step {
                quest_id: "intro".to_string(),
                step_index: 1,
                state: StepState::Finished,
            })
        );
        assert_eq!(Command::parse("xp 120"), Ok(Command::Xp(120)));
        assert_eq!(Command::parse("status"), Ok(Command::Status));
        assert_eq!(Command::parse("exit"), Ok(Command::Quit));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Command::parse("gold lots").is_err());
        assert!(Command::parse("step intro -1 finished").is_err());
        assert!(Command::parse("step intro 0 halfway").is_err());
        assert!(Command::parse("dance").is_err());
        assert!(Command::parse("start").is_err());
    }
}
