//! Write-behind flushers: drain the group-membership cache and the chat
//! message queue from the shared store into MySQL.

pub mod error;
pub mod groups;
pub mod messages;

pub use error::{FlusherError, Result};
pub use groups::GroupFlusher;
pub use messages::MessageFlusher;
