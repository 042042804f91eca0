pub mod capture;
pub mod countdown;
pub mod decision;
pub mod error;
pub mod input;
pub mod instruction;
pub mod logging;
pub mod orchestrator;

pub use capture::{CaptureConfig, CaptureCoordinator, Evidence, GrantStore};
pub use decision::{DecisionConfig, DecisionService, HttpDecisionClient};
pub use error::LoopError;
pub use input::{InputConfig, InputExecutor};
pub use instruction::{Instruction, RawResponse};
pub use orchestrator::{Collaborators, LoopConfig, Orchestrator, RunId, RunObserver, RunState, RunTermination};
