pub mod analyzer;
pub mod chart;
pub mod conversation;
pub mod engine;
pub mod enricher;
pub mod schema_context;
pub mod sql_generator;
pub mod stream;
pub mod validator;

pub use engine::{AiEngine, ChatRequest, ChatResponse, EngineLimits};
pub use stream::{StreamEvent, StreamPhase, StreamSink};
