//! Event Bus
//!
//! In-process publish/subscribe split into typed topics. Everything runs on
//! the single control thread, so topics use `Rc`/`RefCell` rather than locks.
//!
//! Dispatch works on a snapshot of the subscriber list: callbacks may
//! subscribe, unsubscribe or publish while an event is being delivered. A
//! subscriber removed mid-dispatch is not called for the remainder of that
//! dispatch.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::quest::events::{PlayerEvent, QuestEvent, RewardEvent};

type Callback<E> = Rc<dyn Fn(&E)>;

/// Topic identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Quest,
    Player,
    Reward,
}

/// Handle returned by `subscribe`, revoked with `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    topic: TopicKind,
    id: u64,
}

impl Subscription {
    pub fn topic(&self) -> TopicKind {
        self.topic
    }
}

/// Ordered subscriber list for one payload type
pub struct Topic<E> {
    subscribers: RefCell<Vec<(u64, Callback<E>)>>,
}

impl<E> Default for Topic<E> {
    fn default() -> Self {
        Self {
            subscribers: RefCell::new(Vec::new()),
        }
    }
}

impl<E> Topic<E> {
    fn add(&self, id: u64, callback: Callback<E>) {
        self.subscribers.borrow_mut().push((id, callback));
    }

    fn remove(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.borrow_mut();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    fn contains(&self, id: u64) -> bool {
        self.subscribers.borrow().iter().any(|(sub_id, _)| *sub_id == id)
    }

    fn dispatch(&self, event: &E) -> usize {
        let snapshot: Vec<(u64, Callback<E>)> = self.subscribers.borrow().clone();
        let mut delivered = 0;
        for (id, callback) in snapshot {
            if self.contains(id) {
                callback(event);
                delivered += 1;
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.subscribers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Payload types that have a topic on the bus
pub trait BusEvent: fmt::Debug + Sized + 'static {
    const TOPIC: TopicKind;

    fn topic(topics: &Topics) -> &Topic<Self>;

    fn event_type(&self) -> &'static str;
}

/// All topics of one bus
#[derive(Default)]
pub struct Topics {
    quest: Topic<QuestEvent>,
    player: Topic<PlayerEvent>,
    reward: Topic<RewardEvent>,
    next_id: Cell<u64>,
}

impl BusEvent for QuestEvent {
    const TOPIC: TopicKind = TopicKind::Quest;

    fn topic(topics: &Topics) -> &Topic<Self> {
        &topics.quest
    }

    fn event_type(&self) -> &'static str {
        QuestEvent::event_type(self)
    }
}

impl BusEvent for PlayerEvent {
    const TOPIC: TopicKind = TopicKind::Player;

    fn topic(topics: &Topics) -> &Topic<Self> {
        &topics.player
    }

    fn event_type(&self) -> &'static str {
        PlayerEvent::event_type(self)
    }
}

impl BusEvent for RewardEvent {
    const TOPIC: TopicKind = TopicKind::Reward;

    fn topic(topics: &Topics) -> &Topic<Self> {
        &topics.reward
    }

    fn event_type(&self) -> &'static str {
        RewardEvent::event_type(self)
    }
}

/// Shared handle to the bus. Cloning is cheap and every clone sees the same
/// subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Rc<Topics>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for every future event of type `E`
    pub fn subscribe<E: BusEvent>(&self, callback: impl Fn(&E) + 'static) -> Subscription {
        let id = self.topics.next_id.get() + 1;
        self.topics.next_id.set(id);
        E::topic(&self.topics).add(id, Rc::new(callback));
        Subscription { topic: E::TOPIC, id }
    }

    /// Revoke a subscription. Returns false if it was already removed.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let id = subscription.id;
        match subscription.topic {
            TopicKind::Quest => self.topics.quest.remove(id),
            TopicKind::Player => self.topics.player.remove(id),
            TopicKind::Reward => self.topics.reward.remove(id),
        }
    }

    /// Deliver `event` to every current subscriber of its topic, in
    /// subscription order, before returning.
    pub fn publish<E: BusEvent>(&self, event: E) {
        let delivered = E::topic(&self.topics).dispatch(&event);
        trace!("Published {} to {} subscribers", event.event_type(), delivered);
    }

    pub fn subscriber_count(&self, topic: TopicKind) -> usize {
        match topic {
            TopicKind::Quest => self.topics.quest.len(),
            TopicKind::Player => self.topics.player.len(),
            TopicKind::Reward => self.topics.reward.len(),
        }
    }

    /// Non-owning handle for callbacks that publish back onto this bus
    pub fn downgrade(&self) -> WeakEventBus {
        WeakEventBus {
            topics: Rc::downgrade(&self.topics),
        }
    }
}

/// Weak bus handle, so subscribers holding it do not keep the bus alive
#[derive(Clone)]
pub struct WeakEventBus {
    topics: Weak<Topics>,
}

impl WeakEventBus {
    pub fn upgrade(&self) -> Option<EventBus> {
        self.topics.upgrade().map(|topics| EventBus { topics })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder<E: Clone + 'static>() -> (Rc<RefCell<Vec<E>>>, impl Fn(&E) + 'static) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |event: &E| sink.borrow_mut().push(event.clone()))
    }

    #[test]
    fn test_publish_in_subscription_order() {
        let bus = EventBus::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for label in ["ui", "rewards", "dialogue"] {
            let order = order.clone();
            bus.subscribe(move |_: &RewardEvent| order.borrow_mut().push(label));
        }

        bus.publish(RewardEvent::GoldGranted { amount: 5 });
        assert_eq!(*order.borrow(), vec!["ui", "rewards", "dialogue"]);
    }

    #[test]
    fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let (gold, on_reward) = recorder::<RewardEvent>();
        bus.subscribe::<RewardEvent>(on_reward);

        bus.publish(PlayerEvent::LevelChanged { level: 3 });
        assert!(gold.borrow().is_empty());
        assert_eq!(bus.subscriber_count(TopicKind::Reward), 1);
        assert_eq!(bus.subscriber_count(TopicKind::Player), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let (seen, on_level) = recorder::<PlayerEvent>();
        let sub = bus.subscribe::<PlayerEvent>(on_level);

        bus.publish(PlayerEvent::LevelChanged { level: 2 });
        assert!(bus.unsubscribe(sub));
        assert!(!bus.unsubscribe(sub));
        bus.publish(PlayerEvent::LevelChanged { level: 3 });

        assert_eq!(*seen.borrow(), vec![PlayerEvent::LevelChanged { level: 2 }]);
    }

    #[test]
    fn test_unsubscribe_from_inside_callback() {
        let bus = EventBus::new();
        let calls = Rc::new(Cell::new(0));
        let handle: Rc<Cell<Option<Subscription>>> = Rc::new(Cell::new(None));

        let weak = bus.downgrade();
        let (calls_in, handle_in) = (calls.clone(), handle.clone());
        let sub = bus.subscribe(move |_: &PlayerEvent| {
            calls_in.set(calls_in.get() + 1);
            if let (Some(bus), Some(sub)) = (weak.upgrade(), handle_in.get()) {
                bus.unsubscribe(sub);
            }
        });
        handle.set(Some(sub));

        bus.publish(PlayerEvent::LevelChanged { level: 2 });
        bus.publish(PlayerEvent::LevelChanged { level: 3 });
        assert_eq!(calls.get(), 1);
        assert_eq!(bus.subscriber_count(TopicKind::Player), 0);
    }

    #[test]
    fn test_removed_mid_dispatch_is_skipped() {
        let bus = EventBus::new();
        let later: Rc<Cell<Option<Subscription>>> = Rc::new(Cell::new(None));
        let (seen, on_reward) = recorder::<RewardEvent>();

        let weak = bus.downgrade();
        let later_in = later.clone();
        bus.subscribe(move |_: &RewardEvent| {
            if let (Some(bus), Some(sub)) = (weak.upgrade(), later_in.get()) {
                bus.unsubscribe(sub);
            }
        });
        later.set(Some(bus.subscribe::<RewardEvent>(on_reward)));

        bus.publish(RewardEvent::ExperienceGranted { amount: 10 });
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_publish_from_inside_callback() {
        let bus = EventBus::new();
        let (rewards, on_reward) = recorder::<RewardEvent>();
        bus.subscribe::<RewardEvent>(on_reward);

        let weak = bus.downgrade();
        bus.subscribe(move |event: &PlayerEvent| {
            if let (PlayerEvent::LevelChanged { level }, Some(bus)) = (event, weak.upgrade()) {
                bus.publish(RewardEvent::GoldGranted { amount: *level * 10 });
            }
        });

        bus.publish(PlayerEvent::LevelChanged { level: 4 });
        assert_eq!(*rewards.borrow(), vec![RewardEvent::GoldGranted { amount: 40 }]);
    }
}
