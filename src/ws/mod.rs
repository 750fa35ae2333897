//! Real-time layer: rooms over WebSocket connections.
//!
//! Location updates go to the other members of a group room; membership
//! lifecycle events go to the whole room once the store has committed them.

pub mod events;
mod handler;
mod heartbeat;
pub mod manager;
pub mod publish;

pub use events::{ClientMessage, ServerEvent};
pub use handler::{dispatch, ws_handler};
pub use heartbeat::start_heartbeat;
pub use manager::{Room, RoomManager};
