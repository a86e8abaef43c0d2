//! Test fixtures: a client/server pair and recording handlers.

mod handlers;
mod session_pair;

pub use handlers::{CollectHandler, TinyBufferHandler};
pub use session_pair::{SessionPair, read_exact};
