mod client;
mod error;
pub mod orchestrator;
pub mod review;
pub mod streaming;
pub mod transport;
pub mod types;

pub use crate::client::{ChatClient, ClientOptions, Completion};
pub use crate::error::{ApiError, Error};
pub use crate::orchestrator::{
    Callbacks, FailureCause, StreamFailure, StreamHandler, StreamOrchestrator, StreamOutcome,
    StreamSession,
};
pub use crate::transport::{DirectTransport, ProxiedTransport, StreamRequest, StreamTransport};
