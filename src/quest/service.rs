//! Quest Service
//!
//! Connects a `QuestEngine` to the event bus. Inbound events are queued and
//! processed one at a time to completion: an event published by a listener
//! while another is being handled waits its turn instead of re-entering the
//! engine.

use std::cell::{Cell, Ref, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use super::definition::QuestDefinition;
use super::engine::{EngineError, Outbound, QuestEngine, SaveReport};
use super::events::{PlayerEvent, QuestEvent, RewardEvent};
use super::state::{QuestSnapshot, QuestState};
use super::steps::StepSignal;
use crate::bus::{EventBus, Subscription};

/// Work item waiting for the engine
#[derive(Debug)]
enum Inbound {
    Quest(QuestEvent),
    Signal(StepSignal),
    Level(i32),
}

struct Shared {
    engine: RefCell<QuestEngine>,
    inbox: RefCell<VecDeque<Inbound>>,
    pumping: Cell<bool>,
    bus: EventBus,
}

impl Shared {
    fn enqueue(&self, inbound: Inbound) {
        self.inbox.borrow_mut().push_back(inbound);
        self.pump();
    }

    /// Drain the inbox and the engine outbox until both are empty. A nested
    /// call returns at once and leaves the work to the outer loop.
    fn pump(&self) {
        if self.pumping.replace(true) {
            return;
        }

        loop {
            let outbound = {
                let Ok(mut engine) = self.engine.try_borrow_mut() else {
                    warn!("Quest engine busy, deferring {} events", self.inbox.borrow().len());
                    break;
                };
                let next = self.inbox.borrow_mut().pop_front();
                if let Some(inbound) = next {
                    apply(&mut engine, inbound);
                }
                engine.drain_outbox()
            };

            if outbound.is_empty() && self.inbox.borrow().is_empty() {
                break;
            }
            self.publish(outbound);
        }

        self.pumping.set(false);
    }

    fn publish(&self, outbound: Vec<Outbound>) {
        for event in outbound {
            match event {
                Outbound::Quest(event) => self.bus.publish(event),
                Outbound::Reward(event) => self.bus.publish(event),
            }
        }
    }
}

fn apply(engine: &mut QuestEngine, inbound: Inbound) {
    match inbound {
        Inbound::Quest(event) => {
            if let Err(e) = engine.handle(&event) {
                warn!("Ignored {} for quest {}: {}", event.event_type(), event.quest_id(), e);
            }
        }
        Inbound::Signal(signal) => engine.observe(&signal),
        Inbound::Level(level) => engine.on_player_level_change(level),
    }
}

/// Engine attached to a bus. Dropping the service removes its subscriptions.
pub struct QuestService {
    shared: Rc<Shared>,
    subscriptions: Vec<Subscription>,
}

impl QuestService {
    pub fn attach(engine: QuestEngine, bus: &EventBus) -> Self {
        let shared = Rc::new(Shared {
            engine: RefCell::new(engine),
            inbox: RefCell::new(VecDeque::new()),
            pumping: Cell::new(false),
            bus: bus.clone(),
        });

        let mut subscriptions = Vec::new();

        let weak = Rc::downgrade(&shared);
        subscriptions.push(bus.subscribe(move |event: &QuestEvent| {
            if event.is_inbound() {
                with_shared(&weak, |shared| shared.enqueue(Inbound::Quest(event.clone())));
            }
        }));

        let weak = Rc::downgrade(&shared);
        subscriptions.push(bus.subscribe(move |event: &RewardEvent| {
            let signal = match *event {
                RewardEvent::GoldGranted { amount } => StepSignal::GoldGained(amount),
                RewardEvent::ExperienceGranted { amount } => StepSignal::ExperienceGained(amount),
            };
            with_shared(&weak, |shared| shared.enqueue(Inbound::Signal(signal)));
        }));

        let weak = Rc::downgrade(&shared);
        subscriptions.push(bus.subscribe(move |event: &PlayerEvent| {
            if let PlayerEvent::LevelChanged { level } = *event {
                with_shared(&weak, |shared| shared.enqueue(Inbound::Level(level)));
            }
        }));

        debug!("Quest service attached with {} subscriptions", subscriptions.len());
        Self {
            shared,
            subscriptions,
        }
    }

    /// Spawn restored steps and announce every quest
    pub fn startup(&self) {
        self.shared.engine.borrow_mut().startup();
        self.shared.pump();
    }

    pub fn tick(&self) {
        self.shared.engine.borrow_mut().tick();
        self.shared.pump();
    }

    pub fn save_all(&self) -> SaveReport {
        self.shared.engine.borrow_mut().save_all()
    }

    /// Store entries written since the last call
    pub fn drain_store_writes(&self) -> Vec<(String, String)> {
        self.shared.engine.borrow_mut().store_mut().drain_dirty()
    }

    /// Queue an entry for another write attempt
    pub fn mark_dirty(&self, key: &str) {
        self.shared.engine.borrow_mut().store_mut().mark_dirty(key);
    }

    pub fn reload_definitions(
        &self,
        definitions: Vec<QuestDefinition>,
        scripts: HashMap<String, String>,
    ) -> Result<(), EngineError> {
        let result = self
            .shared
            .engine
            .borrow_mut()
            .reload_definitions(definitions, scripts);
        self.shared.pump();
        result
    }

    pub fn engine(&self) -> Ref<'_, QuestEngine> {
        self.shared.engine.borrow()
    }

    pub fn get_quest_state(&self, quest_id: &str) -> Option<QuestState> {
        self.engine().get_quest_state(quest_id)
    }

    pub fn level_requirement_met(&self, required_level: i32) -> bool {
        self.engine().level_requirement_met(required_level)
    }

    pub fn player_level(&self) -> i32 {
        self.engine().player_level()
    }

    pub fn snapshot(&self, quest_id: &str) -> Option<QuestSnapshot> {
        self.engine().snapshot(quest_id)
    }

    pub fn snapshots(&self) -> Vec<QuestSnapshot> {
        self.engine().snapshots()
    }
}

impl Drop for QuestService {
    fn drop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            self.shared.bus.unsubscribe(subscription);
        }
    }
}

fn with_shared(weak: &Weak<Shared>, f: impl FnOnce(&Shared)) {
    if let Some(shared) = weak.upgrade() {
        f(&shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TopicKind;
    use crate::quest::definition::tests::definition;
    use crate::quest::definition::{StepDefinition, StepKind};
    use crate::quest::engine::EngineOptions;
    use crate::quest::persistence::MemoryStore;
    use crate::quest::state::StepState;
    use crate::quest::steps::StepRunner;
    use std::io;
    use std::sync::{Arc, Mutex};

    fn gold_quest(id: &str, amount: i32) -> QuestDefinition {
        QuestDefinition {
            steps: vec![StepDefinition {
                kind: StepKind::CollectGold { amount },
                description: "Collect gold".to_string(),
            }],
            ..definition(id, 1, &[])
        }
    }

    fn service(definitions: Vec<QuestDefinition>, bus: &EventBus) -> QuestService {
        let engine = QuestEngine::new(
            definitions,
            Box::new(MemoryStore::new()),
            Box::new(StepRunner::default()),
            EngineOptions::default(),
        )
        .unwrap();
        QuestService::attach(engine, bus)
    }

    fn record_states(bus: &EventBus) -> Rc<RefCell<Vec<(String, QuestState)>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |event: &QuestEvent| {
            if let QuestEvent::QuestStateChanged(snapshot) = event {
                sink.borrow_mut().push((snapshot.quest_id.clone(), snapshot.state));
            }
        });
        seen
    }

    #[test]
    fn test_gold_step_completes_quest() {
        let bus = EventBus::new();
        let service = service(vec![gold_quest("Q1", 5)], &bus);
        let states = record_states(&bus);
        let rewards = Rc::new(RefCell::new(Vec::new()));
        let sink = rewards.clone();
        bus.subscribe(move |event: &RewardEvent| sink.borrow_mut().push(*event));

        service.startup();
        assert_eq!(states.borrow().last(), Some(&("Q1".to_string(), QuestState::CanStart)));

        bus.publish(QuestEvent::StartQuest { quest_id: "Q1".to_string() });
        assert_eq!(service.get_quest_state("Q1"), Some(QuestState::InProgress));
        assert_eq!(service.snapshot("Q1").unwrap().step_states, vec![StepState::Running]);

        bus.publish(RewardEvent::GoldGranted { amount: 2 });
        assert_eq!(service.get_quest_state("Q1"), Some(QuestState::InProgress));

        bus.publish(RewardEvent::GoldGranted { amount: 3 });
        assert_eq!(service.get_quest_state("Q1"), Some(QuestState::CanFinish));
        assert_eq!(service.snapshot("Q1").unwrap().step_states, vec![StepState::Finished]);

        rewards.borrow_mut().clear();
        bus.publish(QuestEvent::FinishQuest { quest_id: "Q1".to_string() });
        assert_eq!(service.get_quest_state("Q1"), Some(QuestState::Finished));
        assert_eq!(
            *rewards.borrow(),
            vec![
                RewardEvent::GoldGranted { amount: 10 },
                RewardEvent::ExperienceGranted { amount: 50 },
            ]
        );
        assert_eq!(states.borrow().last(), Some(&("Q1".to_string(), QuestState::Finished)));
    }

    #[test]
    fn test_huge_gold_grant_completes_step() {
        let bus = EventBus::new();
        let service = service(vec![gold_quest("Q1", 5)], &bus);

        bus.publish(QuestEvent::StartQuest { quest_id: "Q1".to_string() });
        bus.publish(RewardEvent::GoldGranted { amount: 1 });
        bus.publish(RewardEvent::GoldGranted { amount: i32::MAX });

        assert_eq!(service.get_quest_state("Q1"), Some(QuestState::CanFinish));
    }

    #[test]
    fn test_listener_publishing_during_dispatch() {
        let bus = EventBus::new();
        let service = service(vec![definition("Q1", 1, &[])], &bus);

        // Turn the quest in as soon as it can be finished
        let weak = bus.downgrade();
        bus.subscribe(move |event: &QuestEvent| {
            if let (QuestEvent::QuestStateChanged(snapshot), Some(bus)) = (event, weak.upgrade()) {
                if snapshot.state == QuestState::CanFinish {
                    bus.publish(QuestEvent::FinishQuest {
                        quest_id: snapshot.quest_id.clone(),
                    });
                }
            }
        });

        bus.publish(QuestEvent::StartQuest { quest_id: "Q1".to_string() });
        bus.publish(QuestEvent::AdvanceQuest { quest_id: "Q1".to_string() });
        assert_eq!(service.get_quest_state("Q1"), Some(QuestState::Finished));
    }

    #[test]
    fn test_level_event_unlocks_on_tick() {
        let bus = EventBus::new();
        let mut def = definition("Q1", 1, &[]);
        def.level_required = 3;
        let service = service(vec![def], &bus);

        bus.publish(PlayerEvent::LevelChanged { level: 3 });
        assert_eq!(service.player_level(), 3);
        assert!(service.level_requirement_met(3));
        assert_eq!(service.get_quest_state("Q1"), Some(QuestState::RequirementsNotMet));

        service.tick();
        assert_eq!(service.get_quest_state("Q1"), Some(QuestState::CanStart));
    }

    #[test]
    fn test_invalid_requests_publish_nothing() {
        let bus = EventBus::new();
        let service = service(vec![definition("Q1", 1, &[])], &bus);
        let states = record_states(&bus);

        bus.publish(QuestEvent::FinishQuest { quest_id: "Q1".to_string() });
        bus.publish(QuestEvent::StartQuest { quest_id: "Q404".to_string() });
        bus.publish(QuestEvent::StepStateChanged {
            quest_id: "Q1".to_string(),
            step_index: 3,
            state: StepState::Finished,
        });

        assert!(states.borrow().is_empty());
        assert_eq!(service.get_quest_state("Q1"), Some(QuestState::CanStart));
    }

    /// Log output collected by a scoped subscriber
    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogCapture {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn test_unknown_quest_logs_warning() {
        let capture = LogCapture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let bus = EventBus::new();
            let service = service(vec![definition("Q1", 1, &[])], &bus);
            bus.publish(QuestEvent::StartQuest { quest_id: "Q404".to_string() });
            assert_eq!(service.get_quest_state("Q404"), None);
        });

        let logs = capture.contents();
        let line = logs.lines().find(|line| line.contains("Q404"));
        assert!(line.is_some_and(|line| line.contains("WARN")), "no warning in {:?}", logs);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let service = service(vec![definition("Q1", 1, &[])], &bus);
        assert_eq!(bus.subscriber_count(TopicKind::Quest), 1);

        drop(service);
        assert_eq!(bus.subscriber_count(TopicKind::Quest), 0);
        assert_eq!(bus.subscriber_count(TopicKind::Reward), 0);
        assert_eq!(bus.subscriber_count(TopicKind::Player), 0);
    }

    #[test]
    fn test_store_writes_drain() {
        let bus = EventBus::new();
        let service = service(vec![definition("Q1", 1, &[]), definition("Q2", 1, &[])], &bus);

        bus.publish(QuestEvent::StartQuest { quest_id: "Q1".to_string() });
        let writes = service.drain_store_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "Q1");

        service.mark_dirty("Q1");
        assert_eq!(service.drain_store_writes().len(), 1);

        let report = service.save_all();
        assert_eq!(report.saved, 2);
        assert_eq!(service.drain_store_writes().len(), 2);
    }
}
