// 9.0: reactive decision engine. consumes notifications, emits instructions.
// never holds the source of truth for any financial quantity.

mod config;
mod engine;
mod finality;
mod price_cache;
mod rate_limit;
mod registry;

pub use config::{DecisionConfig, PoolBinding};
pub use engine::{DecisionError, ReactiveDecisionEngine};
pub use finality::{CriticalOpId, FinalityQueue};
pub use price_cache::PriceCache;
pub use rate_limit::RateLimiter;
pub use registry::{ActiveRegistry, TrackedPosition};
