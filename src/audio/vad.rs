// Voice activity detection over a continuous PCM stream
//
// Energy-based detector with hysteresis: speech starts when the frame level
// crosses `threshold_dbfs` for at least `min_speech_ms`, and ends only after
// the level stays below the (lower) release threshold for `min_silence_ms`.
// Captured audio, including a short pre-roll, is handed out as an
// `Utterance` on the speech-end boundary.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use super::frame::AudioFrame;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// Level that must be exceeded to start speech
    #[serde(default = "default_threshold_dbfs")]
    pub threshold_dbfs: f32,
    /// How far below the start threshold the level must fall to count as silence
    #[serde(default = "default_release_offset_db")]
    pub release_offset_db: f32,
    /// Speech shorter than this is discarded as a blip
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u64,
    /// Trailing silence that closes an utterance
    #[serde(default = "default_min_silence_ms")]
    pub min_silence_ms: u64,
    /// Audio kept from before the trigger point
    #[serde(default = "default_pre_roll_ms")]
    pub pre_roll_ms: u64,
    /// Hard cap; an utterance this long is closed even mid-speech
    #[serde(default = "default_max_utterance_ms")]
    pub max_utterance_ms: u64,
}

fn default_threshold_dbfs() -> f32 {
    -40.0
}

fn default_release_offset_db() -> f32 {
    6.0
}

fn default_min_speech_ms() -> u64 {
    50
}

fn default_min_silence_ms() -> u64 {
    550
}

fn default_pre_roll_ms() -> u64 {
    200
}

fn default_max_utterance_ms() -> u64 {
    30_000
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold_dbfs: default_threshold_dbfs(),
            release_offset_db: default_release_offset_db(),
            min_speech_ms: default_min_speech_ms(),
            min_silence_ms: default_min_silence_ms(),
            pre_roll_ms: default_pre_roll_ms(),
            max_utterance_ms: default_max_utterance_ms(),
        }
    }
}

/// A captured stretch of speech, closed on an utterance boundary
#[derive(Debug, Clone)]
pub struct Utterance {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Voiced duration, excluding pre-roll and trailing silence
    pub speech_ms: u64,
}

impl Utterance {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / (self.sample_rate as u64 * self.channels as u64)
    }
}

#[derive(Debug, Clone)]
pub enum VadEvent {
    Silence,
    SpeechStart { speech_ms: u64 },
    SpeechContinue { speech_ms: u64 },
    SpeechEnd(Utterance),
}

pub struct VoiceActivityDetector {
    config: VadConfig,
    is_speaking: bool,
    triggered: bool,
    speech_ms: u64,
    silence_ms: u64,
    capture: Vec<i16>,
    pre_roll: VecDeque<(u64, Vec<i16>)>,
    pre_roll_ms: u64,
    sample_rate: u32,
    channels: u16,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            is_speaking: false,
            triggered: false,
            speech_ms: 0,
            silence_ms: 0,
            capture: Vec::new(),
            pre_roll: VecDeque::new(),
            pre_roll_ms: 0,
            sample_rate: 16000,
            channels: 1,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    /// Voiced duration of the speech currently in progress
    pub fn speech_ms(&self) -> u64 {
        if self.triggered || self.is_speaking {
            self.speech_ms
        } else {
            0
        }
    }

    pub fn reset(&mut self) {
        self.is_speaking = false;
        self.triggered = false;
        self.speech_ms = 0;
        self.silence_ms = 0;
        self.capture.clear();
        self.pre_roll.clear();
        self.pre_roll_ms = 0;
    }

    pub fn process(&mut self, frame: &AudioFrame) -> VadEvent {
        self.sample_rate = frame.sample_rate;
        self.channels = frame.channels;

        let energy = frame.energy_dbfs();
        let duration = frame.duration_ms();
        let is_speech = if self.is_speaking {
            energy >= self.config.threshold_dbfs - self.config.release_offset_db
        } else {
            energy >= self.config.threshold_dbfs
        };

        match (is_speech, self.is_speaking) {
            (true, false) => {
                if !self.triggered {
                    self.triggered = true;
                    self.speech_ms = 0;
                    self.capture.clear();
                    for (_, samples) in self.pre_roll.drain(..) {
                        self.capture.extend_from_slice(&samples);
                    }
                    self.pre_roll_ms = 0;
                }
                self.capture.extend_from_slice(&frame.samples);
                self.speech_ms += duration;

                if self.speech_ms >= self.config.min_speech_ms {
                    self.is_speaking = true;
                    self.silence_ms = 0;
                    debug!("Speech started: {:.1} dBFS, {}ms", energy, self.speech_ms);
                    return VadEvent::SpeechStart {
                        speech_ms: self.speech_ms,
                    };
                }
                VadEvent::Silence
            }
            (true, true) => {
                self.silence_ms = 0;
                self.capture.extend_from_slice(&frame.samples);
                self.speech_ms += duration;

                if self.speech_ms >= self.config.max_utterance_ms {
                    debug!("Utterance reached {}ms cap, closing", self.speech_ms);
                    return self.finish();
                }
                VadEvent::SpeechContinue {
                    speech_ms: self.speech_ms,
                }
            }
            (false, true) => {
                self.capture.extend_from_slice(&frame.samples);
                self.silence_ms += duration;

                if self.silence_ms >= self.config.min_silence_ms {
                    return self.finish();
                }
                VadEvent::SpeechContinue {
                    speech_ms: self.speech_ms,
                }
            }
            (false, false) => {
                if self.triggered {
                    // blip shorter than min_speech_ms
                    self.triggered = false;
                    self.speech_ms = 0;
                    self.capture.clear();
                }
                self.remember_pre_roll(frame, duration);
                VadEvent::Silence
            }
        }
    }

    fn remember_pre_roll(&mut self, frame: &AudioFrame, duration: u64) {
        if self.config.pre_roll_ms == 0 {
            return;
        }
        self.pre_roll.push_back((duration, frame.samples.clone()));
        self.pre_roll_ms += duration;
        while self.pre_roll_ms > self.config.pre_roll_ms {
            match self.pre_roll.pop_front() {
                Some((d, _)) => self.pre_roll_ms -= d,
                None => break,
            }
        }
    }

    fn finish(&mut self) -> VadEvent {
        let utterance = Utterance {
            samples: std::mem::take(&mut self.capture),
            sample_rate: self.sample_rate,
            channels: self.channels,
            speech_ms: self.speech_ms,
        };
        debug!(
            "Speech ended: {}ms voiced, {}ms captured",
            utterance.speech_ms,
            utterance.duration_ms()
        );
        self.is_speaking = false;
        self.triggered = false;
        self.speech_ms = 0;
        self.silence_ms = 0;
        VadEvent::SpeechEnd(utterance)
    }
}
