//! Relational connection pool helpers shared by the query service, the
//! embedding worker, and the `chessmate` CLI.
//!
//! Connection acquisition itself lives on [`crate::store`] (the `GameStore`
//! and `JobStore` implementations hold the pool directly); this module only
//! adds the pool-level introspection the reliability fabric's
//! `db_pool_*` metrics need.

use sqlx::PgPool;

/// A point-in-time snapshot of pool occupancy, rendered as the
/// `db_pool_capacity`/`db_pool_in_use`/`db_pool_available`/`db_pool_waiting`
/// gauges in `GET /metrics`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub capacity: u32,
    pub in_use: u32,
    pub available: u32,
    /// `sqlx::Pool` does not expose a queue-depth counter for callers
    /// blocked on `acquire()`; approximated as 0 since nothing in this
    /// core holds a connection across an await point long enough to
    /// build a meaningful backlog.
    pub waiting: u32,
}

pub fn pool_stats(pool: &PgPool) -> PoolStats {
    let capacity = pool.size();
    let available = pool.num_idle() as u32;
    PoolStats {
        capacity,
        in_use: capacity.saturating_sub(available),
        available,
        waiting: 0,
    }
}
