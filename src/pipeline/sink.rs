use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::audio::AudioFrame;
use crate::error::TransportError;
use crate::room::AudioSink;

/// The session's published audio track.
///
/// Only one writer can exist at a time; the speaking stage holds it for the
/// duration of one utterance.
#[derive(Clone)]
pub struct OutboundSink {
    inner: Arc<Mutex<Box<dyn AudioSink>>>,
}

impl OutboundSink {
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sink)),
        }
    }

    /// Take the writer without waiting; `None` while another stage holds it
    pub fn try_acquire(&self) -> Option<SinkWriter> {
        Arc::clone(&self.inner)
            .try_lock_owned()
            .ok()
            .map(|guard| SinkWriter {
                guard,
                finished: false,
            })
    }

    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Exclusive write access to the outbound sink.
///
/// Dropping a writer that was not `finish`ed discards whatever the transport
/// still has queued, so cancelled speech stops immediately.
pub struct SinkWriter {
    guard: OwnedMutexGuard<Box<dyn AudioSink>>,
    finished: bool,
}

impl SinkWriter {
    pub async fn write(&mut self, frame: AudioFrame) -> Result<(), TransportError> {
        self.guard.capture_frame(frame).await
    }

    /// Release the sink, letting queued audio play out
    pub fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Outbound writer released mid-utterance, clearing queue");
            self.guard.clear_queue();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counts {
        frames: AtomicUsize,
        clears: AtomicUsize,
    }

    struct CountingSink(Arc<Counts>);

    #[async_trait]
    impl AudioSink for CountingSink {
        async fn capture_frame(&mut self, _frame: AudioFrame) -> Result<(), TransportError> {
            self.0.frames.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn clear_queue(&mut self) {
            self.0.clears.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_single_writer() {
        let counts = Arc::new(Counts::default());
        let sink = OutboundSink::new(Box::new(CountingSink(counts.clone())));

        let mut writer = sink.try_acquire().unwrap();
        assert!(sink.is_busy());
        assert!(sink.try_acquire().is_none());

        writer.write(AudioFrame::silence(16000, 1, 20, 0)).await.unwrap();
        writer.finish();

        assert!(!sink.is_busy());
        assert_eq!(counts.frames.load(Ordering::SeqCst), 1);
        assert_eq!(counts.clears.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_writer_clears_queue() {
        let counts = Arc::new(Counts::default());
        let sink = OutboundSink::new(Box::new(CountingSink(counts.clone())));

        let writer = sink.try_acquire().unwrap();
        drop(writer);

        assert_eq!(counts.clears.load(Ordering::SeqCst), 1);
        assert!(sink.try_acquire().is_some());
    }
}
