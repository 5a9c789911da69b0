//! Phase pipeline: decompose, plan, approval gate, execute, verify,
//! publish.

mod driver;
mod policy;
mod runner;

pub use driver::{DriveOutcome, PipelineConfig, PipelineDriver, PipelineError};
pub use policy::{CardFacts, DecomposePolicy, NeverDecompose, ThresholdPolicy};
pub use runner::{
    AgentError, AgentRequest, AgentRunner, ChangeRequest, ChangeRequestOutcome, LoggingRemote,
    ProcessAgentRunner, RemoteError, RemoteRepository,
};
