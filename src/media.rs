//! WAV-file microphone for headless sessions.
//!
//! Opening the file stands in for the permission prompt: a missing file is an
//! unavailable device, an unreadable one is a denied permission. Samples are
//! converted to 16-bit little-endian PCM at the requested channel count and
//! handed out in fixed-duration chunks.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hound::{SampleFormat, WavReader};
use tracing::{debug, warn};
use voice_session::{AudioConstraints, MediaAccessError, MediaResource};

/// Milliseconds of audio per outbound chunk.
pub const CHUNK_MILLIS: u32 = 100;

/// Source of microphone captures.
pub trait Microphone: Send + Sync {
    type Capture: MediaResource + Send;

    fn acquire(&self, constraints: &AudioConstraints) -> Result<Self::Capture, MediaAccessError>;
}

#[derive(Debug, Clone, Default)]
pub struct WavMicrophone {
    path: Option<PathBuf>,
}

impl WavMicrophone {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Microphone for WavMicrophone {
    type Capture = WavCapture;

    fn acquire(&self, constraints: &AudioConstraints) -> Result<WavCapture, MediaAccessError> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| MediaAccessError::DeviceUnavailable("no input file configured".into()))?;
        WavCapture::open(path, constraints)
    }
}

/// Decoded capture. Released captures stop yielding chunks.
#[derive(Debug)]
pub struct WavCapture {
    pcm: Arc<[u8]>,
    chunk_len: usize,
    released: Arc<AtomicBool>,
}

impl WavCapture {
    pub fn open(path: &Path, constraints: &AudioConstraints) -> Result<Self, MediaAccessError> {
        let reader = WavReader::open(path).map_err(|e| map_open_error(path, e))?;
        let spec = reader.spec();
        if spec.sample_rate != constraints.sample_rate {
            warn!(
                file_rate = spec.sample_rate,
                requested = constraints.sample_rate,
                "Input file sample rate differs from the requested rate"
            );
        }

        let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 16) => reader
                .into_samples::<i16>()
                .collect::<Result<_, _>>()
                .map_err(|e| unreadable(path, e))?,
            (SampleFormat::Int, 8) => reader
                .into_samples::<i8>()
                .map(|s| s.map(|v| i16::from(v) << 8))
                .collect::<Result<_, _>>()
                .map_err(|e| unreadable(path, e))?,
            (SampleFormat::Float, 32) => reader
                .into_samples::<f32>()
                .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16))
                .collect::<Result<_, _>>()
                .map_err(|e| unreadable(path, e))?,
            (format, bits) => {
                return Err(MediaAccessError::DeviceUnavailable(format!(
                    "{}: unsupported sample format {format:?}/{bits}",
                    path.display()
                )));
            }
        };

        let pcm = remix(&samples, spec.channels, constraints.channel_count);
        let frame_bytes = 2 * usize::from(constraints.channel_count.max(1));
        let frames_per_chunk = (constraints.sample_rate * CHUNK_MILLIS / 1000).max(1) as usize;
        debug!(path = %path.display(), bytes = pcm.len(), "Opened input file");

        Ok(Self {
            pcm: pcm.into(),
            chunk_len: frames_per_chunk * frame_bytes,
            released: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn byte_len(&self) -> usize {
        self.pcm.len()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Chunk iterator that ends early once the capture is released.
    pub fn stream(&self) -> AudioStream {
        AudioStream {
            pcm: Arc::clone(&self.pcm),
            chunk_len: self.chunk_len,
            offset: 0,
            released: Arc::clone(&self.released),
        }
    }
}

impl MediaResource for WavCapture {
    fn release(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            debug!("Input capture released");
        }
    }
}

pub struct AudioStream {
    pcm: Arc<[u8]>,
    chunk_len: usize,
    offset: usize,
    released: Arc<AtomicBool>,
}

impl Iterator for AudioStream {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.released.load(Ordering::Acquire) || self.offset >= self.pcm.len() {
            return None;
        }
        let end = (self.offset + self.chunk_len).min(self.pcm.len());
        let chunk = self.pcm[self.offset..end].to_vec();
        self.offset = end;
        Some(chunk)
    }
}

/// Interleaved samples to PCM16 LE with `to` channels. Extra channels are
/// averaged down; a mono source is duplicated up.
fn remix(samples: &[i16], from: u16, to: u16) -> Vec<u8> {
    let from = usize::from(from.max(1));
    let to = usize::from(to.max(1));
    let mut out = Vec::with_capacity(samples.len() / from * to * 2);
    for frame in samples.chunks_exact(from) {
        let mixed = (frame.iter().map(|&s| i32::from(s)).sum::<i32>() / from as i32) as i16;
        for channel in 0..to {
            let sample = if from == to { frame[channel] } else { mixed };
            out.extend_from_slice(&sample.to_le_bytes());
        }
    }
    out
}

fn map_open_error(path: &Path, err: hound::Error) -> MediaAccessError {
    match err {
        hound::Error::IoError(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            MediaAccessError::PermissionDenied(path.display().to_string())
        }
        hound::Error::IoError(e) if e.kind() == io::ErrorKind::NotFound => {
            MediaAccessError::DeviceUnavailable(format!("{} not found", path.display()))
        }
        other => unreadable(path, other),
    }
}

fn unreadable(path: &Path, err: hound::Error) -> MediaAccessError {
    MediaAccessError::DeviceUnavailable(format!("{}: {err}", path.display()))
}
