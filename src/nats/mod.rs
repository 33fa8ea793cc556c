pub mod client;
pub mod messages;

pub use client::{event_subject, transcript_line, transcript_subject, NatsClient, NatsEventPublisher};
pub use messages::{SessionEventMessage, TranscriptMessage};
