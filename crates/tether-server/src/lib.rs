pub mod bridge;
pub mod control;
pub mod error;
pub mod server;

pub use bridge::{BridgeFrame, RetryIntent, TransportBridge, TurnStream};
pub use control::{CancelResult, ControlSurface, ResolveResult};
pub use error::ServerError;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
