//! Line-delimited TCP chat layer.
//!
//! One spawned task per connection; a [`Room`] broadcast hub fans every chat
//! line out to all connected sessions. Persistence and transfers go through
//! the database facade, always off the reactor via `spawn_blocking`.

pub mod room;
pub mod session;

pub use room::Room;
pub use session::{handle_connection, serve};
