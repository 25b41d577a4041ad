pub mod errors;
pub mod events;
pub mod ids;

pub use errors::RelayError;
pub use events::RoomEvent;
pub use ids::{ConnectionId, RoomId};
