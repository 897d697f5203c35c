//! Subscription tiers
//!
//! Paid tiers carry the plan slug chosen at checkout (`pro`, `business`, ...).
//! Only the free tier has a fixed name.

/// Tier assigned to users without an active subscription
pub const FREE_TIER: &str = "free";
