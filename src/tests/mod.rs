//! Race Tests Module
//!
//! Concurrent writers against one event row: convergence, monotonicity,
//! idempotence and partial-failure scenarios.
