//! Staged producer/consumer analysis.
//!
//! ```text
//! reader -> parser -> aggregator -> evaluator -> writer
//! ```
//!
//! The same five stages run either as threads joined by bounded channels ([`shared`]) or as
//! separate processes exchanging versioned envelopes over pipes ([`distributed`]). A stage runs
//! until its input ends, drains whatever it still holds, signals end-of-stream downstream and
//! terminates; the coordinator returns only when every stage has terminated.

use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::report::SinkSummary;
use crate::RecordCounts;

pub mod distributed;
pub mod envelope;
pub mod shared;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Reader,
    Parser,
    Aggregator,
    Evaluator,
    Writer,
}

impl Stage {
    pub const ALL: [Stage; 5] = [Stage::Reader, Stage::Parser, Stage::Aggregator, Stage::Evaluator, Stage::Writer];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Reader => "reader",
            Stage::Parser => "parser",
            Stage::Aggregator => "aggregator",
            Stage::Evaluator => "evaluator",
            Stage::Writer => "writer",
        }
    }

    /// The stage this one consumes from.
    pub fn upstream(&self) -> Option<Stage> {
        match self {
            Stage::Reader => None,
            Stage::Parser => Some(Stage::Reader),
            Stage::Aggregator => Some(Stage::Parser),
            Stage::Evaluator => Some(Stage::Aggregator),
            Stage::Writer => Some(Stage::Evaluator),
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name() == name)
            .ok_or_else(|| format!("unknown stage `{name}`"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StageState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Terminated = 3,
}

impl StageState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StageState::Idle,
            1 => StageState::Running,
            2 => StageState::Draining,
            _ => StageState::Terminated,
        }
    }
}

/// Lifecycle of one stage, observable from the coordinator while the stage runs.
#[derive(Debug, Clone)]
pub struct StageStatus {
    stage: Stage,
    state: Arc<AtomicU8>,
}

impl StageStatus {
    pub fn new(stage: Stage) -> Self {
        Self { stage, state: Arc::new(AtomicU8::new(StageState::Idle as u8)) }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn get(&self) -> StageState {
        StageState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set(&self, state: StageState) {
        self.state.store(state as u8, Ordering::Release);
        debug!(stage = %self.stage, ?state, "stage transition");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSummary {
    pub counts: RecordCounts,
    pub windows: usize,
    pub report: SinkSummary,
    pub stages: Vec<(Stage, StageState)>,
}

#[cfg(test)]
mod tests {

    use super::{Stage, StageState, StageStatus};

    #[test]
    fn test_stage_names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(stage.name().parse::<Stage>().unwrap(), stage);
        }
        assert!("mapper".parse::<Stage>().is_err());
        assert_eq!(Stage::Writer.upstream(), Some(Stage::Evaluator));
        assert_eq!(Stage::Reader.upstream(), None);
    }

    #[test]
    fn test_stage_status_is_shared() {
        let status = StageStatus::new(Stage::Parser);
        let observer = status.clone();
        assert_eq!(observer.get(), StageState::Idle);
        status.set(StageState::Draining);
        assert_eq!(observer.get(), StageState::Draining);
        status.set(StageState::Terminated);
        assert_eq!(observer.get(), StageState::Terminated);
    }
}
