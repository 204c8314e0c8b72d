pub mod errors;
pub mod events;
pub mod ids;

pub use errors::SessionFault;
pub use events::{ClientEvent, EndNotice, EndedBy, PresenceSnapshot, ServerEvent};
pub use ids::ConnectionId;
