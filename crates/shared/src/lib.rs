// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Recap shared infrastructure
//!
//! Pieces used by both the API server and the background worker:
//!
//! - **Database**: connection pools and embedded migrations
//! - **Rate limiting**: fixed-window counters with in-memory and Redis backends
//! - **Tiers**: subscription tier names mirrored onto users

pub mod db;
pub mod rate_limit;
pub mod tier;

pub use db::{create_pool, run_migrations};
pub use rate_limit::{
    InMemoryRateLimitStore, RateLimitError, RateLimitResult, RateLimitStore, RateLimiter,
    RedisRateLimitStore,
};
pub use tier::FREE_TIER;
