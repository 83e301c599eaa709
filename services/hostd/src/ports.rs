//! Display port pool.
//!
//! Ports are drawn from a fixed configured range and are at all times
//! either free or held by one running node; the pool never loses or
//! duplicates a port.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// No free port remained in the configured range.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no free display port in {start}..={end}")]
pub struct PortExhausted {
    pub start: u16,
    pub end: u16,
}

/// Allocator for display ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortPool {
    start: u16,
    end: u16,
    free: BTreeSet<u16>,
}

impl PortPool {
    /// Create a pool with every port in the range free.
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let (start, end) = (*range.start(), *range.end());
        Self {
            start,
            end,
            free: range.collect(),
        }
    }

    /// Create a pool from the configured range minus the ports currently
    /// held by running nodes. Used at recovery so a restart can neither
    /// leak nor double-allocate a port.
    pub fn with_held(range: RangeInclusive<u16>, held: &BTreeSet<u16>) -> Self {
        let (start, end) = (*range.start(), *range.end());
        Self {
            start,
            end,
            free: range.filter(|p| !held.contains(p)).collect(),
        }
    }

    /// Remove and return the lowest-numbered free port.
    pub fn acquire(&mut self) -> Result<u16, PortExhausted> {
        self.free.pop_first().ok_or(PortExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Return a port to the free set.
    ///
    /// Idempotent: releasing an already-free or out-of-range port is a
    /// no-op, never an error.
    pub fn release(&mut self, port: u16) {
        if (self.start..=self.end).contains(&port) {
            self.free.insert(port);
        }
    }

    /// Snapshot of the free ports, ascending. Persisted with node state.
    pub fn free_ports(&self) -> Vec<u16> {
        self.free.iter().copied().collect()
    }
}
