pub mod adapters;
pub mod browser;
pub mod detect;
pub mod llm;
pub mod plan;
pub mod sequencer;
pub mod verify;

pub use adapters::{
    ActionInterpreter, AnswerExtractor, GoalVerifier, InteractionChannel, PageDriver,
    PagePerceiver, Planner, ProgressSink, Replanner, SequencerError, TargetResolver,
};
pub use browser::{Browser, BrowserConfig, BrowserDriver, PageView};
pub use llm::{LlmClient, LlmConfig};
pub use plan::{Action, ActionStatus, ExecutionResult, ExecutionSummary, Plan, SessionValues};
pub use sequencer::{ExecuteOptions, Sequencer, SequencerConfig};
