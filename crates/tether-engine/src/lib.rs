//! Turn engine: normalizes upstream events into chunks, accumulates them into
//! durable messages, brokers tool approvals and owns the turn lifecycle.

pub mod accumulator;
pub mod broker;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod sink;
pub mod transformer;

pub use accumulator::{MessageAccumulator, ToolResolved};
pub use broker::{ApprovalDecision, ApprovalTicket, Resolution, ResolutionReason, ToolApprovalBroker};
pub use config::{EmptyResponsePolicy, EngineConfig};
pub use error::EngineError;
pub use orchestrator::{TurnHandle, TurnOrchestrator, TurnRequest};
pub use registry::{CancelHandle, SessionRegistry};
pub use sink::ChunkSink;
pub use transformer::ChunkTransformer;
