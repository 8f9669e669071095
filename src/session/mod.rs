//! Room sessions and their observable state

pub mod room;
pub mod state;

pub use room::RoomSession;
pub use state::{SessionErrorRecord, SessionSnapshot};
