//! Media-room plumbing
//!
//! - `connector`: joins a room with a signed credential and applies the
//!   subscription policy, retrying transient transport failures
//! - `registry`: participant presence and stream ownership, kept in step
//!   with the mixer's source set
//! - `transport`: the seam a media transport implements
//! - `livekit_transport`: the production implementation over LiveKit
//! - `local`: in-process rooms implementing that seam, for tests
//! - `token`: access-token claim checks and issuance

pub mod connector;
pub mod livekit_transport;
pub mod local;
pub mod registry;
pub mod token;
pub mod transport;

pub use connector::{RetryPolicy, RoomConnector, RoomEvents, RoomHandle, SubscriptionPolicy};
pub use livekit_transport::{LiveKitSettings, LiveKitTransport};
pub use local::{LocalParticipant, LocalRoom, LocalRoomServer, LocalTrack, OutputStats};
pub use registry::{Participant, ParticipantEvent, ParticipantRegistry, StreamHandle};
pub use token::{LiveKitTokenIssuer, TokenIssuer};
pub use transport::{AudioSink, RoomConnection, RoomEvent, RoomSession, RoomTransport};
