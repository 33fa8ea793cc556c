pub mod frame;
pub mod mixer;
pub mod stream;
pub mod vad;
pub mod wav;

pub use frame::{AudioFrame, PcmFramer};
pub use mixer::{downmix, ConferenceAudioMixer, MixMode, MixerConfig};
pub use stream::AudioStream;
pub use vad::{Utterance, VadConfig, VadEvent, VoiceActivityDetector};
pub use wav::encode_wav;
