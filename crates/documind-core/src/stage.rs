//! Pipeline stages and the per-run state machine.
//!
//! ```text
//! queued → parsing → analyzing → graphing → optimizing → generating → validating → done
//!    └────────┴──────────┴──────────┴───────────┴────────────┴─────────────┴──→ failed
//! ```
//!
//! Every non-terminal state has exactly one failure transition. `done` and
//! `failed` are terminal.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Parse,
    Analyze,
    BuildGraph,
    Optimize,
    Generate,
    Validate,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Parse,
        Stage::Analyze,
        Stage::BuildGraph,
        Stage::Optimize,
        Stage::Generate,
        Stage::Validate,
    ];

    /// Operation name, as used in failure reports.
    pub fn name(self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::Analyze => "analyze",
            Stage::BuildGraph => "buildKnowledgeGraph",
            Stage::Optimize => "optimizeContext",
            Stage::Generate => "generate",
            Stage::Validate => "validate",
        }
    }

    /// Phase name while the stage is running.
    pub fn phase(self) -> &'static str {
        match self {
            Stage::Parse => "parsing",
            Stage::Analyze => "analyzing",
            Stage::BuildGraph => "graphing",
            Stage::Optimize => "optimizing",
            Stage::Generate => "generating",
            Stage::Validate => "validating",
        }
    }

    /// Progress percentage reported once this stage has completed.
    pub fn progress_on_complete(self) -> u8 {
        match self {
            Stage::Parse => 15,
            Stage::Analyze => 45,
            Stage::BuildGraph => 60,
            Stage::Optimize => 75,
            Stage::Generate => 90,
            Stage::Validate => 100,
        }
    }

    pub fn next(self) -> Option<Stage> {
        let idx = Stage::ALL.iter().position(|s| *s == self)?;
        Stage::ALL.get(idx + 1).copied()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of a single pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Queued,
    Running(Stage),
    Done,
    Failed(Stage),
}

impl RunState {
    /// Move to the next stage (or `Done` after validation). `None` from a
    /// terminal state.
    pub fn advance(self) -> Option<RunState> {
        match self {
            RunState::Queued => Some(RunState::Running(Stage::Parse)),
            RunState::Running(stage) => Some(
                stage
                    .next()
                    .map(RunState::Running)
                    .unwrap_or(RunState::Done),
            ),
            RunState::Done | RunState::Failed(_) => None,
        }
    }

    /// The single failure transition. A queued run that fails is attributed
    /// to the parse stage, since nothing else has started.
    pub fn fail(self) -> Option<RunState> {
        match self {
            RunState::Queued => Some(RunState::Failed(Stage::Parse)),
            RunState::Running(stage) => Some(RunState::Failed(stage)),
            RunState::Done | RunState::Failed(_) => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed(_))
    }

    /// Coarse status label: `queued`, `running`, `completed` or `failed`.
    pub fn status(self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running(_) => "running",
            RunState::Done => "completed",
            RunState::Failed(_) => "failed",
        }
    }

    /// Fine-grained phase label.
    pub fn phase(self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running(stage) => stage.phase(),
            RunState::Done => "done",
            RunState::Failed(_) => "failed",
        }
    }

    /// Progress in `0..=100`: the completion mark of the last finished stage.
    pub fn progress(self) -> u8 {
        match self {
            RunState::Queued => 0,
            RunState::Running(stage) | RunState::Failed(stage) => Stage::ALL
                .iter()
                .take_while(|s| **s != stage)
                .last()
                .map(|s| s.progress_on_complete())
                .unwrap_or(0),
            RunState::Done => 100,
        }
    }
}
