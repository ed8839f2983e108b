//! Gateway for OpenAI-compatible chat-completions backends.
//!
//! Every model call in the system goes through [`Gateway`]: it owns retry
//! policy, JSON recovery, token accounting, and telemetry emission. Callers
//! tag their work with [`with_session`] / [`with_agent`] so records are
//! attributable without any global state.

pub mod context;
pub mod gateway;
pub mod record;
pub mod recovery;
pub mod transport;
pub mod types;

pub use context::{current_agent, current_session, with_agent, with_session};
pub use gateway::Gateway;
pub use record::{AiCallRecord, CallParameters, CallSink};
pub use recovery::parse_json;
pub use transport::{ChatTransport, OpenAiTransport};
pub use types::{CallOptions, ChatMessage, ChatRequest, ChatResponse, Completion};
