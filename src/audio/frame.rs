/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since the stream started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16, timestamp_ms: u64) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
            timestamp_ms,
        }
    }

    /// A frame of digital silence lasting `duration_ms`.
    pub fn silence(sample_rate: u32, channels: u16, duration_ms: u64, timestamp_ms: u64) -> Self {
        let len = samples_for(sample_rate, channels, duration_ms);
        Self::new(vec![0; len], sample_rate, channels, timestamp_ms)
    }

    /// Duration covered by this frame in milliseconds
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0;
        }
        let per_channel = self.samples.len() as u64 / self.channels as u64;
        per_channel * 1000 / self.sample_rate as u64
    }

    /// Root-mean-square level of the frame in dBFS (silence is -inf clamped to -120).
    pub fn energy_dbfs(&self) -> f32 {
        energy_dbfs(&self.samples)
    }
}

/// Number of interleaved samples covering `duration_ms`.
pub fn samples_for(sample_rate: u32, channels: u16, duration_ms: u64) -> usize {
    (sample_rate as u64 * channels as u64 * duration_ms / 1000) as usize
}

pub fn energy_dbfs(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return SILENCE_FLOOR_DBFS;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_squares / samples.len() as f64).sqrt();
    if rms < 1.0 {
        return SILENCE_FLOOR_DBFS;
    }
    let db = 20.0 * (rms / i16::MAX as f64).log10();
    (db as f32).max(SILENCE_FLOOR_DBFS)
}

pub const SILENCE_FLOOR_DBFS: f32 = -120.0;

/// Splits a little-endian 16-bit PCM byte stream into fixed-size frames.
///
/// Provider responses arrive in arbitrary chunk sizes, possibly splitting a
/// sample across two chunks; the odd byte is carried over.
#[derive(Debug)]
pub struct PcmFramer {
    sample_rate: u32,
    channels: u16,
    samples_per_frame: usize,
    carry: Option<u8>,
    pending: Vec<i16>,
    emitted_ms: u64,
}

impl PcmFramer {
    pub fn new(sample_rate: u32, channels: u16, frame_ms: u64) -> Self {
        let samples_per_frame = samples_for(sample_rate, channels, frame_ms).max(1);
        Self {
            sample_rate,
            channels,
            samples_per_frame,
            carry: None,
            pending: Vec::with_capacity(samples_per_frame),
            emitted_ms: 0,
        }
    }

    /// Feed raw bytes; returns every complete frame now available.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        let mut rest = bytes;
        if let Some(low) = self.carry.take() {
            if let Some((&high, tail)) = rest.split_first() {
                self.pending.push(i16::from_le_bytes([low, high]));
                rest = tail;
            } else {
                self.carry = Some(low);
            }
        }

        let mut chunks = rest.chunks_exact(2);
        for pair in &mut chunks {
            self.pending.push(i16::from_le_bytes([pair[0], pair[1]]));
        }
        if let [odd] = chunks.remainder() {
            self.carry = Some(*odd);
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.samples_per_frame {
            let samples: Vec<i16> = self.pending.drain(..self.samples_per_frame).collect();
            frames.push(self.emit(samples));
        }
        frames
    }

    /// Flush the trailing partial frame, padded with silence.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let mut samples = std::mem::take(&mut self.pending);
        samples.resize(self.samples_per_frame, 0);
        Some(self.emit(samples))
    }

    fn emit(&mut self, samples: Vec<i16>) -> AudioFrame {
        let frame = AudioFrame::new(samples, self.sample_rate, self.channels, self.emitted_ms);
        self.emitted_ms += frame.duration_ms();
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(vec![0; 320], 16000, 1, 0);
        assert_eq!(frame.duration_ms(), 20);

        let stereo = AudioFrame::new(vec![0; 640], 16000, 2, 0);
        assert_eq!(stereo.duration_ms(), 20);
    }

    #[test]
    fn test_silence_has_floor_energy() {
        let frame = AudioFrame::silence(16000, 1, 20, 0);
        assert_eq!(frame.samples.len(), 320);
        assert_eq!(frame.energy_dbfs(), SILENCE_FLOOR_DBFS);
    }

    #[test]
    fn test_full_scale_energy_near_zero_db() {
        let frame = AudioFrame::new(vec![i16::MAX; 160], 16000, 1, 0);
        assert!(frame.energy_dbfs().abs() < 0.01);

        let quiet = AudioFrame::new(vec![328; 160], 16000, 1, 0);
        assert!((quiet.energy_dbfs() + 40.0).abs() < 0.5, "~1% of full scale is -40 dBFS");
    }

    #[test]
    fn test_framer_carries_split_sample() {
        // 2 samples per frame at 1 kHz / 2 ms
        let mut framer = PcmFramer::new(1000, 1, 2);

        let bytes: Vec<u8> = [100i16, -200, 300].iter().flat_map(|s| s.to_le_bytes()).collect();
        let first = framer.push(&bytes[..3]);
        assert_eq!(first.len(), 0);

        let second = framer.push(&bytes[3..]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].samples, vec![100, -200]);

        let last = framer.flush().unwrap();
        assert_eq!(last.samples, vec![300, 0]);
        assert_eq!(last.timestamp_ms, 2);
        assert!(framer.flush().is_none());
    }
}
