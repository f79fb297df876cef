//! Player Progression
//!
//! Experience, level and gold of the player, fed by reward events. Level-ups
//! are published back on the bus where the quest engine picks them up.

use std::cell::{Ref, RefCell};
use std::rc::Rc;

use tracing::{debug, info};

use crate::bus::{EventBus, Subscription};
use crate::quest::events::{PlayerEvent, RewardEvent};

/// Stat points granted per level gained
pub const STAT_POINTS_PER_LEVEL: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerStats {
    level: i32,
    /// Experience into the current level
    experience: i32,
    /// Experience needed to finish the current level
    max_experience: i32,
    stat_points: i32,
    gold: i32,
}

impl PlayerStats {
    pub fn new(level: i32, max_experience: i32) -> Self {
        Self {
            level,
            experience: 0,
            max_experience: max_experience.max(1),
            stat_points: 0,
            gold: 0,
        }
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn experience(&self) -> i32 {
        self.experience
    }

    pub fn max_experience(&self) -> i32 {
        self.max_experience
    }

    pub fn stat_points(&self) -> i32 {
        self.stat_points
    }

    pub fn gold(&self) -> i32 {
        self.gold
    }

    /// Add experience, levelling up while the bar overflows. Returns the
    /// events to publish: one `LevelChanged` per level gained, then the new
    /// experience total.
    pub fn grant_experience(&mut self, amount: i32) -> Vec<PlayerEvent> {
        let mut events = Vec::new();
        self.experience = self.experience.saturating_add(amount);

        while self.experience >= self.max_experience {
            self.experience -= self.max_experience;
            self.max_experience = ((self.max_experience as f32 * 1.5) as i32).max(1);
            self.level = self.level.saturating_add(1);
            self.stat_points = self.stat_points.saturating_add(STAT_POINTS_PER_LEVEL);
            info!("Player reached level {}", self.level);
            events.push(PlayerEvent::LevelChanged { level: self.level });
        }

        events.push(PlayerEvent::ExperienceChanged {
            experience: self.experience,
        });
        events
    }

    pub fn grant_gold(&mut self, amount: i32) {
        self.gold = self.gold.saturating_add(amount);
        debug!("Player gold is now {}", self.gold);
    }

    pub fn set_level(&mut self, level: i32) -> PlayerEvent {
        self.level = level;
        PlayerEvent::LevelChanged { level }
    }
}

/// `PlayerStats` subscribed to the reward topic
pub struct Progression {
    stats: Rc<RefCell<PlayerStats>>,
    bus: EventBus,
    subscription: Subscription,
}

impl Progression {
    pub fn attach(stats: PlayerStats, bus: &EventBus) -> Self {
        let stats = Rc::new(RefCell::new(stats));

        let weak = Rc::downgrade(&stats);
        let publisher = bus.downgrade();
        let subscription = bus.subscribe(move |event: &RewardEvent| {
            let Some(stats) = weak.upgrade() else {
                return;
            };
            let events = match *event {
                RewardEvent::GoldGranted { amount } => {
                    stats.borrow_mut().grant_gold(amount);
                    Vec::new()
                }
                RewardEvent::ExperienceGranted { amount } => stats.borrow_mut().grant_experience(amount),
            };
            if let Some(bus) = publisher.upgrade() {
                for event in events {
                    bus.publish(event);
                }
            }
        });

        Self {
            stats,
            bus: bus.clone(),
            subscription,
        }
    }

    /// Publish the current level and experience so listeners can sync
    pub fn announce(&self) {
        let (level, experience) = {
            let stats = self.stats.borrow();
            (stats.level(), stats.experience())
        };
        self.bus.publish(PlayerEvent::LevelChanged { level });
        self.bus.publish(PlayerEvent::ExperienceChanged { experience });
    }

    /// Force a level, e.g. from a debug command
    pub fn set_level(&self, level: i32) {
        let event = self.stats.borrow_mut().set_level(level);
        self.bus.publish(event);
    }

    pub fn stats(&self) -> Ref<'_, PlayerStats> {
        self.stats.borrow()
    }
}

impl Drop for Progression {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.subscription);
    }
}
