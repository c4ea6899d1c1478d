//! Matrix stages.

use serde::{Deserialize, Serialize};

/// An ordered phase of a matrix run.
///
/// Stages run strictly in [`Stage::ORDER`]; a stage only starts after every
/// job of the previous one succeeded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Self-contained tests, no backing service.
    Unit,

    /// Tests against a backing service started per job.
    Integration,
}

impl Stage {
    /// Execution order of stages.
    pub const ORDER: [Stage; 2] = [Stage::Unit, Stage::Integration];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Unit => "unit",
            Stage::Integration => "integration",
        }
    }

    /// Human-readable title used in reports.
    pub fn title(&self) -> &'static str {
        match self {
            Stage::Unit => "Unit tests",
            Stage::Integration => "Integration Test",
        }
    }

    /// Whether jobs of this stage need the service bootstrapper.
    pub fn requires_service(&self) -> bool {
        matches!(self, Stage::Integration)
    }

    /// The stage that runs after this one, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Unit => Some(Stage::Integration),
            Stage::Integration => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
