// Stepwise: hierarchical workflow engine
// Core library providing the state machine, effect executor and backend client

pub mod action;
pub mod action_stream;
pub mod backend;
pub mod config;
pub mod context_store;
pub mod errors;
pub mod executor;
pub mod logging;
pub mod runner;
pub mod state_machine;
pub mod template;

// Re-export commonly used types
pub use errors::{
    BackendError, BackendResult, ConfigError, ConfigResult, TemplateError, TemplateResult,
    WorkflowError, WorkflowResult,
};

pub use action::{Action, ActionExecutor, ActionScope, LocalActionExecutor, UpdateRequester};

pub use action_stream::{
    ActionLineDecoder, DecoderConfig, DecoderStatistics, MalformedLine, SequenceRecord,
};

pub use backend::{
    FeedbackRequest, FeedbackResponse, HttpBackend, SequenceRequest, SequenceStream,
    WorkflowBackend,
};

pub use config::{BackendConfig, ConfigManager, LoggingConfig, RunnerConfig, StepwiseConfig};

pub use context_store::{ChecklistItem, ContextSnapshot, ContextStore, ThinkingEntry, TodoItem};

pub use executor::{feedback_event, EffectDeps, Executor};

pub use logging::init_logging;

pub use runner::{WorkflowHandle, WorkflowRunner};

pub use state_machine::{
    lookup, transition_table, EventKind, ExecutionContext, ExecutionHistory,
    ExecutionHistoryEntry, MachineSnapshot, PendingUpdate, WorkflowEvent, WorkflowState,
    WorkflowStateMachine,
};

pub use template::{Stage, Step, StepStatus, TemplateFormat, TemplateStore, WorkflowTemplate};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
