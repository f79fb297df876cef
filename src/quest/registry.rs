//! Quest Registry
//!
//! Loads quest definitions and step scripts from disk and validates them as a
//! set. Supports hot-reloading during development.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::definition::{DefinitionError, QuestDefinition};

/// Bulk source of authored quests
pub trait DefinitionSource {
    fn load_definitions(&mut self) -> Result<Vec<QuestDefinition>, DefinitionError>;
}

impl DefinitionSource for Vec<QuestDefinition> {
    fn load_definitions(&mut self) -> Result<Vec<QuestDefinition>, DefinitionError> {
        validate_definitions(self)?;
        Ok(self.clone())
    }
}

/// Check a definition set for duplicate ids, dangling prerequisites and
/// prerequisite loops
pub fn validate_definitions(definitions: &[QuestDefinition]) -> Result<(), DefinitionError> {
    let mut ids = HashSet::new();
    for quest in definitions {
        if !ids.insert(quest.id.as_str()) {
            return Err(DefinitionError::DuplicateId(quest.id.clone()));
        }
    }

    for quest in definitions {
        for prerequisite in &quest.prerequisites {
            if prerequisite == &quest.id {
                return Err(DefinitionError::SelfPrerequisite(quest.id.clone()));
            }
            if !ids.contains(prerequisite.as_str()) {
                return Err(DefinitionError::UnknownPrerequisite {
                    quest: quest.id.clone(),
                    prerequisite: prerequisite.clone(),
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(definitions) {
        return Err(DefinitionError::PrerequisiteCycle(cycle));
    }

    Ok(())
}

/// First prerequisite loop found, as the ids along it ending where it started
fn find_cycle(definitions: &[QuestDefinition]) -> Option<Vec<String>> {
    let requires: HashMap<&str, &[String]> = definitions
        .iter()
        .map(|quest| (quest.id.as_str(), quest.prerequisites.as_slice()))
        .collect();
    let mut cleared = HashSet::new();

    for quest in definitions {
        let mut path = Vec::new();
        if visit(&quest.id, &requires, &mut path, &mut cleared) {
            return Some(path.into_iter().map(str::to_string).collect());
        }
    }
    None
}

fn visit<'a>(
    id: &'a str,
    requires: &HashMap<&'a str, &'a [String]>,
    path: &mut Vec<&'a str>,
    cleared: &mut HashSet<&'a str>,
) -> bool {
    if cleared.contains(id) {
        return false;
    }
    if let Some(start) = path.iter().position(|seen| *seen == id) {
        path.drain(..start);
        path.push(id);
        return true;
    }

    path.push(id);
    for prerequisite in requires.get(id).copied().unwrap_or_default() {
        if visit(prerequisite, requires, path, cleared) {
            return true;
        }
    }
    path.pop();
    cleared.insert(id);
    false
}

/// Registry for quest definitions stored as TOML files
pub struct QuestRegistry {
    /// Base directory for quest data
    data_dir: PathBuf,
    /// Base directory for step scripts
    scripts_dir: PathBuf,
    /// Lua script sources (script_path -> source code)
    scripts: HashMap<String, String>,
}

impl QuestRegistry {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.join("quests"),
            scripts_dir: data_dir.join("scripts").join("steps"),
            scripts: HashMap::new(),
        }
    }

    /// Load and validate every quest under the data directory, along with
    /// the scripts their steps reference.
    pub fn load_all(&mut self) -> Result<Vec<QuestDefinition>, DefinitionError> {
        info!("Loading quests from {:?}", self.data_dir);

        if !self.data_dir.exists() {
            warn!("Quest directory does not exist: {:?}", self.data_dir);
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        collect_toml_files(&self.data_dir, &mut paths)?;
        // Directory order is platform dependent
        paths.sort();

        let mut definitions = Vec::with_capacity(paths.len());
        for path in &paths {
            let content = std::fs::read_to_string(path).map_err(|e| DefinitionError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let quest = QuestDefinition::from_toml(&path.display().to_string(), &content)?;
            info!("Loaded quest: {} ({})", quest.name, quest.id);
            definitions.push(quest);
        }

        validate_definitions(&definitions)?;

        let mut scripts = HashMap::new();
        for quest in &definitions {
            for script in quest.scripts() {
                if scripts.contains_key(script) {
                    continue;
                }
                let full_path = self.scripts_dir.join(script);
                let source = std::fs::read_to_string(&full_path).map_err(|_| {
                    DefinitionError::MissingScript {
                        quest: quest.id.clone(),
                        script: script.to_string(),
                    }
                })?;
                info!("Loaded step script: {}", script);
                scripts.insert(script.to_string(), source);
            }
        }
        self.scripts = scripts;

        info!("Loaded {} quest definitions", definitions.len());
        Ok(definitions)
    }

    /// Step script sources keyed by their path under `scripts/steps`
    pub fn scripts(&self) -> &HashMap<String, String> {
        &self.scripts
    }

    /// Start a file watcher over the quest and script directories.
    /// The receiver yields the path of every changed file.
    pub fn start_file_watcher(&self) -> Result<mpsc::Receiver<HotReloadEvent>, String> {
        use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

        let (tx, rx) = mpsc::channel(32);
        let data_dir = self.data_dir.clone();
        let scripts_dir = self.scripts_dir.clone();

        std::thread::spawn(move || {
            let (notify_tx, notify_rx) = std::sync::mpsc::channel();

            let mut watcher = match RecommendedWatcher::new(
                move |res: Result<notify::Event, notify::Error>| {
                    if let Ok(event) = res {
                        let _ = notify_tx.send(event);
                    }
                },
                Config::default().with_poll_interval(Duration::from_secs(1)),
            ) {
                Ok(w) => w,
                Err(e) => {
                    error!("Failed to create file watcher: {}", e);
                    return;
                }
            };

            for dir in [&data_dir, &scripts_dir] {
                if dir.exists() {
                    if let Err(e) = watcher.watch(dir, RecursiveMode::Recursive) {
                        error!("Failed to watch {:?}: {}", dir, e);
                    }
                }
            }

            info!("Quest hot-reload watcher started for {:?} and {:?}", data_dir, scripts_dir);

            while let Ok(event) = notify_rx.recv() {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }
                for path in &event.paths {
                    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                    if extension != "toml" && extension != "lua" {
                        continue;
                    }
                    info!("Detected change in {:?}, triggering reload", path);
                    let changed = HotReloadEvent::Changed(path.to_string_lossy().to_string());
                    if tx.blocking_send(changed).is_err() {
                        error!("Hot-reload receiver dropped, stopping watcher");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

impl DefinitionSource for QuestRegistry {
    fn load_definitions(&mut self) -> Result<Vec<QuestDefinition>, DefinitionError> {
        self.load_all()
    }
}

/// Recursively collect TOML files under `dir`
fn collect_toml_files(dir: &Path, paths: &mut Vec<PathBuf>) -> Result<(), DefinitionError> {
    let io_error = |e: std::io::Error| DefinitionError::Io {
        path: dir.display().to_string(),
        reason: e.to_string(),
    };

    for entry in std::fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path.is_dir() {
            collect_toml_files(&path, paths)?;
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }

    Ok(())
}

/// Events from the hot-reload watcher
#[derive(Debug, Clone)]
pub enum HotReloadEvent {
    /// A quest or script file changed on disk
    Changed(String),
}
