// Conference audio mixer for combining participant streams
//
// This module produces one continuous downmixed stream from a dynamically
// changing set of inbound participant tracks:
// - Each registered source is pumped into its own sample buffer
// - Every slice, the mixer takes an atomic snapshot of the source set and
//   sums exactly one slice of samples from each source, with clipping
// - Sources without a full slice buffered contribute silence
//
// The source set is copy-on-write: add/remove swap in a new set under a
// short-held lock, and the mix arithmetic runs on the snapshot without it.
// The agent's own identity is refused at insertion time, so synthesized
// output can never feed back into recognition.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{samples_for, AudioFrame};
use super::stream::AudioStream;

/// How the mixer combines its sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixMode {
    /// Exactly one source is expected; its samples are forwarded unchanged
    PassThrough,
    /// Clamped sample-wise sum of every registered source
    Summing,
}

/// Configuration for the conference mixer
#[derive(Debug, Clone)]
pub struct MixerConfig {
    /// Sample rate of every input and of the output
    pub sample_rate: u32,
    /// Number of channels in output
    pub channels: u16,
    /// Length of one output slice in milliseconds (default: 20ms)
    pub slice_ms: u64,
    /// A source silent for this long is reported as stalled (default: 2s)
    pub watchdog: Duration,
    /// Maximum buffered audio per source before the oldest samples are dropped
    pub max_buffer_ms: u64,
    pub mode: MixMode,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            slice_ms: 20,
            watchdog: Duration::from_secs(2),
            max_buffer_ms: 200,
            mode: MixMode::Summing,
        }
    }
}

impl MixerConfig {
    pub fn samples_per_slice(&self) -> usize {
        samples_for(self.sample_rate, self.channels, self.slice_ms)
    }
}

/// Mix equal-length sample slices by adding them together with clipping
///
/// Inputs shorter than `len` are padded with silence.
pub fn downmix(inputs: &[&[i16]], len: usize) -> Vec<i16> {
    let mut mixed = Vec::with_capacity(len);
    for i in 0..len {
        let sum: i32 = inputs
            .iter()
            .map(|samples| samples.get(i).copied().unwrap_or(0) as i32)
            .sum();
        mixed.push(sum.clamp(i16::MIN as i32, i16::MAX as i32) as i16);
    }
    mixed
}

/// One registered input: the pump task writes, the mixer reads
struct MixerSource {
    identity: String,
    track_sid: String,
    buffer: Mutex<VecDeque<i16>>,
    last_frame_at: Mutex<Instant>,
    stalled: AtomicBool,
    retired: AtomicBool,
    cancel: CancellationToken,
}

impl MixerSource {
    fn new(identity: String, track_sid: String, cancel: CancellationToken) -> Self {
        Self {
            identity,
            track_sid,
            buffer: Mutex::new(VecDeque::new()),
            last_frame_at: Mutex::new(Instant::now()),
            stalled: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            cancel,
        }
    }

    fn push(&self, frame: &AudioFrame, max_buffered: usize) {
        if self.retired.load(Ordering::SeqCst) {
            return;
        }
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.extend(frame.samples.iter().copied());

        let overflow = buffer.len().saturating_sub(max_buffered);
        if overflow > 0 {
            warn!(
                "Dropping {} buffered samples from {} (buffer full)",
                overflow, self.identity
            );
            buffer.drain(..overflow);
        }
        drop(buffer);

        *self
            .last_frame_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        if self.stalled.swap(false, Ordering::SeqCst) {
            info!("Source {} resumed after stall", self.identity);
        }
    }

    /// Take one full slice, or nothing if less than a slice is buffered
    fn take_slice(&self, len: usize) -> Option<Vec<i16>> {
        if self.retired.load(Ordering::SeqCst) {
            return None;
        }
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.len() < len {
            return None;
        }
        Some(buffer.drain(..len).collect())
    }

    fn buffered(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn check_watchdog(&self, watchdog: Duration) {
        if self.retired.load(Ordering::SeqCst) {
            return;
        }
        let idle = self
            .last_frame_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        if idle >= watchdog && !self.stalled.swap(true, Ordering::SeqCst) {
            warn!(
                "Source {} stalled: no frames for {:?}, mixing as silence",
                self.identity, idle
            );
        }
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

struct MixerInner {
    config: MixerConfig,
    self_identity: String,
    sources: RwLock<Arc<Vec<Arc<MixerSource>>>>,
    slice_index: AtomicU64,
    shutdown: CancellationToken,
}

/// Downmixes every registered participant stream into one recognition input
#[derive(Clone)]
pub struct ConferenceAudioMixer {
    inner: Arc<MixerInner>,
}

impl ConferenceAudioMixer {
    /// `self_identity` is the agent's own participant identity; it is never mixed
    pub fn new(config: MixerConfig, self_identity: impl Into<String>) -> Self {
        let self_identity = self_identity.into();
        info!(
            "Conference mixer initialized: {}Hz, {} channels, {}ms slices, {:?} (excluding {})",
            config.sample_rate, config.channels, config.slice_ms, config.mode, self_identity
        );

        Self {
            inner: Arc::new(MixerInner {
                config,
                self_identity,
                sources: RwLock::new(Arc::new(Vec::new())),
                slice_index: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &MixerConfig {
        &self.inner.config
    }

    pub fn self_identity(&self) -> &str {
        &self.inner.self_identity
    }

    /// Register a stream as a mix input.
    ///
    /// Returns `false` if the stream belongs to the agent itself. A stream for
    /// an identity that is already present replaces the previous one.
    pub fn add_source(&self, mut stream: AudioStream) -> bool {
        if stream.identity() == self.inner.self_identity {
            debug!("Refusing agent's own stream as mix input: {}", stream.identity());
            return false;
        }

        let source = Arc::new(MixerSource::new(
            stream.identity().to_string(),
            stream.track_sid().to_string(),
            self.inner.shutdown.child_token(),
        ));

        let replaced = self.update_sources(|sources| {
            let replaced = sources
                .iter()
                .position(|s| s.identity == source.identity)
                .map(|idx| sources.remove(idx));
            sources.push(Arc::clone(&source));
            replaced
        });
        if let Some(old) = replaced {
            debug!("Replacing mix source for {} ({})", old.identity, old.track_sid);
            old.retire();
        }

        let config = &self.inner.config;
        let max_buffered = samples_for(config.sample_rate, config.channels, config.max_buffer_ms)
            .max(config.samples_per_slice());
        let (sample_rate, channels) = (config.sample_rate, config.channels);

        let pump_source = Arc::clone(&source);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_source.cancel.cancelled() => break,
                    frame = stream.recv() => {
                        let Some(frame) = frame else {
                            debug!("Stream for {} ended", pump_source.identity);
                            break;
                        };
                        if frame.sample_rate != sample_rate || frame.channels != channels {
                            warn!(
                                "Frame format mismatch from {}: expected {}Hz/{}ch, got {}Hz/{}ch. Dropping frame.",
                                pump_source.identity, sample_rate, channels, frame.sample_rate, frame.channels
                            );
                            continue;
                        }
                        pump_source.push(&frame, max_buffered);
                    }
                }
            }
        });

        info!(
            "Added mix source {} ({})",
            source.identity, source.track_sid
        );
        true
    }

    /// Remove a source; its buffered audio is discarded immediately
    pub fn remove_source(&self, identity: &str) -> bool {
        let removed = self.update_sources(|sources| {
            sources
                .iter()
                .position(|s| s.identity == identity)
                .map(|idx| sources.remove(idx))
        });

        match removed {
            Some(source) => {
                source.retire();
                info!("Removed mix source {} ({})", source.identity, source.track_sid);
                true
            }
            None => false,
        }
    }

    pub fn remove_all(&self) {
        let drained = self.update_sources(std::mem::take);
        for source in drained {
            source.retire();
        }
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.snapshot().iter().any(|s| s.identity == identity)
    }

    pub fn source_identities(&self) -> Vec<String> {
        self.snapshot().iter().map(|s| s.identity.clone()).collect()
    }

    pub fn source_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Samples currently buffered for a source
    pub fn buffered_samples(&self, identity: &str) -> Option<usize> {
        self.snapshot()
            .iter()
            .find(|s| s.identity == identity)
            .map(|s| s.buffered())
    }

    /// Whether the watchdog has marked a source as stalled
    pub fn is_stalled(&self, identity: &str) -> Option<bool> {
        self.snapshot()
            .iter()
            .find(|s| s.identity == identity)
            .map(|s| s.stalled.load(Ordering::SeqCst))
    }

    /// Produce the next output slice from the current source snapshot
    pub fn mix_next_slice(&self) -> AudioFrame {
        let config = &self.inner.config;
        let len = config.samples_per_slice();
        let snapshot = self.snapshot();

        let mut contributions: Vec<Vec<i16>> = Vec::with_capacity(snapshot.len());
        for source in snapshot.iter() {
            match source.take_slice(len) {
                Some(samples) => contributions.push(samples),
                None => source.check_watchdog(config.watchdog),
            }
        }

        let samples = match config.mode {
            MixMode::PassThrough => {
                if contributions.len() > 1 {
                    warn!(
                        "Pass-through mixer has {} active sources, forwarding the first",
                        contributions.len()
                    );
                }
                contributions.into_iter().next().unwrap_or_else(|| vec![0; len])
            }
            MixMode::Summing => {
                let inputs: Vec<&[i16]> = contributions.iter().map(|c| c.as_slice()).collect();
                downmix(&inputs, len)
            }
        };

        let index = self.inner.slice_index.fetch_add(1, Ordering::SeqCst);
        AudioFrame::new(
            samples,
            config.sample_rate,
            config.channels,
            index * config.slice_ms,
        )
    }

    /// Spawn the slice clock; mixed frames are delivered in strictly
    /// increasing time order until `cancel` fires or the receiver is dropped.
    pub fn start(&self, cancel: CancellationToken) -> mpsc::Receiver<AudioFrame> {
        let (tx, rx) = mpsc::channel(64);
        let mixer = self.clone();
        let slice = Duration::from_millis(self.inner.config.slice_ms.max(1));

        tokio::spawn(async move {
            info!("Starting conference mixing");
            let mut ticker = tokio::time::interval(slice);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let frame = mixer.mix_next_slice();
                        if tx.send(frame).await.is_err() {
                            debug!("Mixer output closed");
                            break;
                        }
                    }
                }
            }

            mixer.remove_all();
            info!(
                "Conference mixing complete: {} slices produced",
                mixer.inner.slice_index.load(Ordering::SeqCst)
            );
        });

        rx
    }

    /// Stop every pump task and drop all sources
    pub fn shutdown(&self) {
        self.remove_all();
        self.inner.shutdown.cancel();
    }

    fn snapshot(&self) -> Arc<Vec<Arc<MixerSource>>> {
        let guard = self
            .inner
            .sources
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    fn update_sources<R>(&self, f: impl FnOnce(&mut Vec<Arc<MixerSource>>) -> R) -> R {
        let mut guard = self
            .inner
            .sources
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<Arc<MixerSource>> = guard.as_ref().clone();
        let result = f(&mut next);
        *guard = Arc::new(next);
        result
    }
}
