// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the timecard engine coordinator.

use serde::Serialize;

/// Engine lifecycle state.
///
/// Use [`super::TimecardEngine::state()`] to check the current state or
/// [`super::TimecardEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Accepting reads and writes
    Running,
    /// Shutdown in progress: writes refused, queue being drained
    Draining,
    /// Background tasks stopped, final drain done
    Stopped,
}

impl EngineState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Draining => write!(f, "Draining"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}
