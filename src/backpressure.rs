// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backpressure derived from write-queue fill.
//!
//! The batch processor buffers writes optimistically while the store is
//! unavailable. As the queue fills, the engine sheds optional work first
//! (background TTL refreshes) and only rejects real writes once the queue is
//! full.
//!
//! # Example
//!
//! ```
//! use timecard_engine::BackpressureLevel;
//!
//! let level = BackpressureLevel::from_fill(4_000, 15_000);
//! assert_eq!(level, BackpressureLevel::Normal);
//! assert!(level.should_accept_background());
//!
//! let level = BackpressureLevel::from_fill(13_000, 15_000);
//! assert_eq!(level, BackpressureLevel::High);
//! assert!(!level.should_accept_background());
//! assert!(level.should_accept_writes());
//!
//! let level = BackpressureLevel::from_fill(15_000, 15_000);
//! assert!(!level.should_accept_writes());
//! ```

use serde::Serialize;

/// Backpressure level based on queue fill ratio.
///
/// - **Normal** (< 50%): accept everything
/// - **Elevated** (50-80%): accept everything, warn
/// - **High** (80-100%): shed background writes
/// - **Saturated** (full): reject new writes with `Overloaded`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureLevel {
    Normal = 0,
    Elevated = 1,
    High = 2,
    Saturated = 3,
}

impl BackpressureLevel {
    /// Calculate backpressure level from pressure ratio (0.0 → 1.0)
    #[must_use]
    pub fn from_pressure(pressure: f64) -> Self {
        match pressure {
            p if p < 0.50 => Self::Normal,
            p if p < 0.80 => Self::Elevated,
            p if p < 1.0 => Self::High,
            _ => Self::Saturated,
        }
    }

    #[must_use]
    pub fn from_fill(depth: usize, capacity: usize) -> Self {
        if capacity == 0 {
            return Self::Saturated;
        }
        Self::from_pressure(depth as f64 / capacity as f64)
    }

    #[must_use]
    pub fn should_accept_writes(&self) -> bool {
        !matches!(self, Self::Saturated)
    }

    /// Background work (TTL refreshes) is optional and goes first.
    #[must_use]
    pub fn should_accept_background(&self) -> bool {
        matches!(self, Self::Normal | Self::Elevated)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Elevated => "Write queue filling",
            Self::High => "Write queue nearly full - background writes shed",
            Self::Saturated => "Write queue full - writes rejected",
        }
    }
}

impl std::fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
