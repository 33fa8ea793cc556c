//! Turn-taking pipeline
//!
//! - `state`: the turn state machine and its legal transitions
//! - `sink`: exclusive ownership of the session's outbound audio
//! - `turn`: recognition, reasoning and synthesis stages with barge-in

pub mod sink;
pub mod state;
pub mod turn;

pub use sink::{OutboundSink, SinkWriter};
pub use state::{IllegalTransition, TurnMachine, TurnState};
pub use turn::{PipelineConfig, PipelineExit, StageProviders, StageTimeouts, TurnPipeline};
