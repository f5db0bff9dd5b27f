// Control command handlers for whatever front end embeds the daemon

pub mod daemon;

// Re-export all commands for registration
pub use daemon::*;
