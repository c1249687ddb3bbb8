//! Optional metrics instrumentation for tessera.
//!
//! When the `observe` feature is enabled, daemon and coordinator operations
//! emit counters and gauges via the [`metrics`] crate. A downstream
//! application must install a metrics recorder (e.g. `metrics-exporter-prometheus`)
//! to collect the data.
//!
//! When the feature is **not** enabled every function in this module is a
//! zero-cost no-op.

/// Record a successfully applied batch.
///
/// - `tessera.agent.batches_total` – counter with `projection` label
/// - `tessera.agent.events_applied_total` – counter with `projection` label
#[inline]
pub fn record_batch_applied(projection: &str, events: usize) {
    #[cfg(feature = "observe")]
    {
        let projection = projection.to_string();
        metrics::counter!("tessera.agent.batches_total", "projection" => projection.clone())
            .increment(1);
        metrics::counter!("tessera.agent.events_applied_total", "projection" => projection)
            .increment(events as u64);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (projection, events);
    }
}

/// Record a continuation decided by the policy engine.
///
/// - `tessera.policy.continuations_total` – counter with `kind` label
#[inline]
pub fn record_continuation(kind: &'static str) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("tessera.policy.continuations_total", "kind" => kind).increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = kind;
    }
}

/// Record a dead-lettered event.
///
/// - `tessera.agent.dead_letters_total` – counter with `projection` label
#[inline]
pub fn record_dead_letter(projection: &str) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("tessera.agent.dead_letters_total", "projection" => projection.to_string())
            .increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = projection;
    }
}

/// Record an advisory lock attempt.
///
/// - `tessera.lock.attempts_total` – counter with `outcome` label (`acquired` / `contended`)
#[inline]
pub fn record_lock_attempt(acquired: bool) {
    #[cfg(feature = "observe")]
    {
        let outcome = if acquired { "acquired" } else { "contended" };
        metrics::counter!("tessera.lock.attempts_total", "outcome" => outcome).increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = acquired;
    }
}

/// Set the number of agents per status for one database.
///
/// - `tessera.daemon.agents` – gauge with `database` and `status` labels
#[inline]
pub fn set_agent_counts(database: &str, running: usize, paused: usize, stopped: usize) {
    #[cfg(feature = "observe")]
    {
        for (status, count) in [("running", running), ("paused", paused), ("stopped", stopped)] {
            metrics::gauge!(
                "tessera.daemon.agents",
                "database" => database.to_string(),
                "status" => status
            )
            .set(count as f64);
        }
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (database, running, paused, stopped);
    }
}
