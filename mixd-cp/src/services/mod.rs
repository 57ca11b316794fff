//! Control-plane services

pub mod callback_router;
pub mod engine_protocol;
pub mod engine_session;
pub mod queue_engine;
pub mod stem_cache;
pub mod stem_fulfilment;
pub mod worker_client;
pub mod worker_supervisor;

pub use callback_router::{CallbackError, CallbackRouter};
pub use engine_protocol::{Deck, InboundMessage, OutboundMessage, TrackInfoReply};
pub use engine_session::{engine_channel, EngineHandle, EngineSession, EngineSessionConfig, SessionState};
pub use queue_engine::{BulkSummary, QueueEngine, QueueEngineConfig, SweepReport};
pub use stem_cache::{StemCache, StemCacheConfig};
pub use stem_fulfilment::{StemFulfilment, StemFulfilmentConfig};
pub use worker_client::{WorkerClient, WorkerClientConfig, WorkerError};
pub use worker_supervisor::{WorkerStatus, WorkerSupervisor, WorkerSupervisorConfig};
