pub mod audio;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod http;
pub mod nats;
pub mod pipeline;
pub mod providers;
pub mod room;
pub mod session;

pub use audio::{AudioFrame, ConferenceAudioMixer, MixMode, MixerConfig, VadConfig};
pub use config::Config;
pub use dispatcher::{Dispatcher, DispatcherSettings, SessionServices, SessionTicket};
pub use error::{ConnectionError, DispatchError, ProviderError, StartError, TransportError};
pub use events::{EventPublisher, SessionEvent, SessionEventKind};
pub use http::{create_router, AppState};
pub use nats::{NatsClient, NatsEventPublisher, SessionEventMessage, TranscriptMessage};
pub use pipeline::{TurnPipeline, TurnState};
pub use providers::{HttpProviderFactory, ProviderFactory, ProviderSettings};
pub use room::{LiveKitTransport, LocalRoomServer, RoomConnector, TokenIssuer};
pub use session::{
    SessionHandle, SessionLifecycleManager, SessionMode, SessionRequest, SessionStatus,
    StatusReport,
};
