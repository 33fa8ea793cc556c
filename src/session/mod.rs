//! Voice-agent session management
//!
//! This module provides the `SessionLifecycleManager` that owns one session:
//! - Room connection with the mode's subscription policy
//! - Participant registry and conference mixer
//! - Turn pipeline (recognition, reasoning, synthesis, barge-in)
//! - Status reporting, idle timeout and teardown

mod config;
mod manager;
mod status;

pub use config::{AudioSettings, SessionConfig, SessionDefaults, SessionMode, SessionRequest};
pub use manager::{SessionHandle, SessionLifecycleManager};
pub use status::{SessionStatus, StatusReport};
