//! Logical clock backed by the node's fact table.
//!
//! A node's tick moves once per sync generation, not once per write, so all
//! local writes between two syncs share one tick and form a dirty cohort.
//! The clock is an injected service: every sync operation receives it
//! explicitly rather than reading an ambient global.

use crate::error::{CoreError, CoreResult};
use crate::store::{Database, Transaction};
use crate::types::{Tick, NEVER_SYNCED};
use std::sync::Arc;
use tracing::debug;

/// Fact holding the tick stamped onto new local writes.
pub const FACT_CURRENT_TICK: &str = "sync.current_tick";
/// Fact holding the last tick whose cohort was pushed successfully.
pub const FACT_LAST_PUSH: &str = "sync.last_successful_push";
/// Fact holding the counterpart tick up to which records were pulled.
pub const FACT_LAST_PULL: &str = "sync.last_successful_pull";

/// Tick a fresh node starts writing at.
pub const INITIAL_TICK: Tick = 0;

/// Per-node logical clock.
#[derive(Clone)]
pub struct LogicalClock {
    db: Arc<Database>,
}

impl LogicalClock {
    /// Creates a clock over the database's fact table.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Tick stamped onto writes made now.
    pub fn current_tick(&self) -> CoreResult<Tick> {
        read_fact(self.db.fact(FACT_CURRENT_TICK), FACT_CURRENT_TICK, INITIAL_TICK)
    }

    /// Allocates and persists a new generation tick.
    pub fn advance_generation(&self) -> CoreResult<Tick> {
        self.db.transaction(|txn| {
            let next = txn_current_tick(txn)? + 1;
            write_tick(txn, FACT_CURRENT_TICK, next);
            Ok(next)
        })
    }

    /// Moves the current tick forward to at least `at_least`.
    ///
    /// Used by a node to adopt the authority's clock so its ticks never lag
    /// behind the authority's.
    pub fn adopt(&self, at_least: Tick) -> CoreResult<Tick> {
        self.db.transaction(|txn| {
            let current = txn_current_tick(txn)?;
            let next = current.max(at_least);
            if next != current {
                write_tick(txn, FACT_CURRENT_TICK, next);
            }
            Ok(next)
        })
    }

    /// Closes the current cohort and returns the newest sealed tick.
    ///
    /// After this returns `t`, every write stamped at or below `t` is
    /// committed and no later write through the gateway can be stamped at or
    /// below `t`. The clock only advances if the current tick has been
    /// written to; otherwise `current - 1` is already sealed.
    pub fn seal_generation(&self) -> CoreResult<Tick> {
        self.db.transaction(|txn| {
            let current = txn_current_tick(txn)?;
            if txn.max_written_tick() >= current {
                write_tick(txn, FACT_CURRENT_TICK, current + 1);
                debug!(sealed = current, "sealed generation");
                Ok(current)
            } else {
                Ok(current - 1)
            }
        })
    }

    /// Allocates a tick that no other writer will ever use, then moves the
    /// current tick past it.
    ///
    /// Returns `(tick, tock)`: `tick` is exclusive to the caller, `tock` is
    /// the new current tick.
    pub fn tick_tock(&self) -> CoreResult<(Tick, Tick)> {
        self.db.transaction(|txn| {
            let tick = txn_current_tick(txn)? + 1;
            let tock = tick + 1;
            write_tick(txn, FACT_CURRENT_TICK, tock);
            Ok((tick, tock))
        })
    }

    /// Last tick whose cohort was pushed successfully.
    pub fn last_push(&self) -> CoreResult<Tick> {
        read_fact(self.db.fact(FACT_LAST_PUSH), FACT_LAST_PUSH, NEVER_SYNCED)
    }

    /// Overwrites the last pushed tick.
    pub fn set_last_push(&self, tick: Tick) -> CoreResult<()> {
        self.db.transaction(|txn| {
            write_tick(txn, FACT_LAST_PUSH, tick);
            Ok(())
        })
    }

    /// Counterpart tick up to which records were pulled.
    pub fn last_pull(&self) -> CoreResult<Tick> {
        read_fact(self.db.fact(FACT_LAST_PULL), FACT_LAST_PULL, NEVER_SYNCED)
    }

    /// Overwrites the last pulled tick.
    pub fn set_last_pull(&self, tick: Tick) -> CoreResult<()> {
        self.db.transaction(|txn| {
            write_tick(txn, FACT_LAST_PULL, tick);
            Ok(())
        })
    }

    /// Records a completed session in one transaction: both baselines move
    /// forward (never back) and a new generation tick is allocated.
    pub fn commit_session(&self, pushed_through: Tick, pulled_through: Tick) -> CoreResult<Tick> {
        self.db.transaction(|txn| {
            let push = read_fact(txn.fact(FACT_LAST_PUSH).map(str::to_owned), FACT_LAST_PUSH, NEVER_SYNCED)?;
            let pull = read_fact(txn.fact(FACT_LAST_PULL).map(str::to_owned), FACT_LAST_PULL, NEVER_SYNCED)?;
            write_tick(txn, FACT_LAST_PUSH, push.max(pushed_through));
            write_tick(txn, FACT_LAST_PULL, pull.max(pulled_through));
            let next = txn_current_tick(txn)? + 1;
            write_tick(txn, FACT_CURRENT_TICK, next);
            Ok(next)
        })
    }
}

/// Reads the current tick inside an open transaction.
pub(crate) fn txn_current_tick(txn: &Transaction<'_>) -> CoreResult<Tick> {
    read_fact(
        txn.fact(FACT_CURRENT_TICK).map(str::to_owned),
        FACT_CURRENT_TICK,
        INITIAL_TICK,
    )
}

fn write_tick(txn: &mut Transaction<'_>, key: &str, tick: Tick) {
    txn.set_fact(key, tick.to_string());
}

fn read_fact(raw: Option<String>, key: &str, default: Tick) -> CoreResult<Tick> {
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| CoreError::InvalidFact {
            key: key.to_owned(),
            value,
        }),
    }
}


