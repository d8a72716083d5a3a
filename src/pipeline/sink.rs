use super::stages::AudioConvert;
use crate::backends::AudioFormat;
use crate::error::{ProviderError, Result};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink};
use std::fs::File;
use std::io::Write;
use std::os::fd::OwnedFd;

/// Upper bound on audio held back while a request is paused.
pub const MAX_PAUSED_BYTES: usize = 32 * 1024 * 1024;

fn paused_overflow() -> ProviderError {
    ProviderError::stage("sink", "too much audio buffered while paused")
}

/// Where a request's audio ends up.
pub enum SinkTarget {
    /// Play through the default audio output device.
    Device,
    /// Write raw S16LE bytes into a caller-supplied stream.
    Stream(Box<dyn Write + Send>),
}

impl SinkTarget {
    /// Wraps a file descriptor handed over by a client.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self::Stream(Box::new(File::from(fd)))
    }

    pub(crate) fn open(self, format: AudioFormat) -> Result<Box<dyn AudioSink>> {
        match self {
            SinkTarget::Device => Ok(Box::new(DeviceSink::open(format)?)),
            SinkTarget::Stream(writer) => Ok(Box::new(StreamSink::new(writer))),
        }
    }
}

impl std::fmt::Debug for SinkTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkTarget::Device => write!(f, "Device"),
            SinkTarget::Stream(_) => write!(f, "Stream"),
        }
    }
}

/// Final stage of a pipeline. Lives on the pipeline's streaming thread.
pub trait AudioSink {
    fn write(&mut self, samples: &[f32]) -> Result<()>;

    fn set_paused(&mut self, paused: bool) -> Result<()>;

    /// True once everything written so far has left the sink.
    fn is_drained(&self) -> bool;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Plays samples on the default output device.
pub struct DeviceSink {
    // Audio stream must live as long as the sink
    _stream: OutputStream,
    sink: Sink,
    format: AudioFormat,
    paused: bool,
    /// Samples queued since the last pause.
    held: usize,
}

impl DeviceSink {
    pub fn open(format: AudioFormat) -> Result<Self> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| ProviderError::stage("sink", format!("no audio output device: {}", e)))?;
        let sink = Sink::try_new(&handle)
            .map_err(|e| ProviderError::stage("sink", format!("failed to create sink: {}", e)))?;

        Ok(Self {
            _stream: stream,
            sink,
            format,
            paused: false,
            held: 0,
        })
    }
}

impl AudioSink for DeviceSink {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        if self.paused {
            self.held += samples.len();
            if self.held * 2 > MAX_PAUSED_BYTES {
                return Err(paused_overflow());
            }
        }
        self.sink.append(SamplesBuffer::new(
            self.format.channels,
            self.format.sample_rate,
            samples.to_vec(),
        ));
        Ok(())
    }

    fn set_paused(&mut self, paused: bool) -> Result<()> {
        self.paused = paused;
        if paused {
            self.held = 0;
            self.sink.pause();
        } else {
            self.sink.play();
        }
        Ok(())
    }

    fn is_drained(&self) -> bool {
        self.sink.empty()
    }
}

/// Converts samples back to S16LE and writes them to a byte stream. While
/// paused, converted bytes are held back (up to a limit) and flushed on resume.
pub struct StreamSink {
    writer: Box<dyn Write + Send>,
    paused: bool,
    pending: Vec<u8>,
    limit: usize,
}

impl StreamSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self::with_limit(writer, MAX_PAUSED_BYTES)
    }

    pub fn with_limit(writer: Box<dyn Write + Send>, limit: usize) -> Self {
        Self {
            writer,
            paused: false,
            pending: Vec::new(),
            limit,
        }
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .map_err(|e| ProviderError::stage("sink", e.to_string()))
    }
}

impl AudioSink for StreamSink {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        let bytes = AudioConvert::to_s16le(samples);
        if self.paused {
            if self.pending.len() + bytes.len() > self.limit {
                return Err(paused_overflow());
            }
            self.pending.extend_from_slice(&bytes);
            Ok(())
        } else {
            self.emit(&bytes)
        }
    }

    fn set_paused(&mut self, paused: bool) -> Result<()> {
        self.paused = paused;
        if !paused && !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            self.emit(&pending)?;
        }
        Ok(())
    }

    fn is_drained(&self) -> bool {
        !self.paused && self.pending.is_empty()
    }

    fn finish(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| ProviderError::stage("sink", e.to_string()))
    }
}
