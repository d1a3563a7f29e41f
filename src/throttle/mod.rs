//! Sliding-window throttling: event storage, rules and rule chains.

mod chain;
mod classify;
mod clock;
mod rule;
mod sharded;
mod store;

pub use chain::{Decision, FailurePolicy, ThrottleChain};
pub use classify::Classifier;
pub use clock::{Clock, ManualClock, SystemClock};
pub use rule::{ThrottleRule, WindowRule, WindowRuleBuilder, DEFAULT_CLEANUP_INTERVAL};
pub use sharded::ShardedEventStore;
pub use store::{EventStore, MemoryEventStore};
