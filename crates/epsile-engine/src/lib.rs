pub mod actor;
pub mod error;
pub mod matchmaker;
pub mod mock;
pub mod outbox;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod session;

pub use actor::EngineHandle;
pub use error::EngineError;
pub use outbox::Outbox;
pub use presence::PresenceAccounting;
pub use registry::SessionState;
pub use session::{EngineConfig, EngineStats, EventOutcome, InboundEvent, SessionEngine};
