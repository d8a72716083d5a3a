pub mod espeak;
pub mod piper;

use crate::config_loader::Settings;
use crate::error::Result;
use std::path::PathBuf;
use std::sync::Arc;

/// Size of the raw audio chunks handed from a backend to the pipeline.
pub const CHUNK_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SampleEncoding {
    S16LE,
}

/// Describes the raw PCM a voice produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
}

impl AudioFormat {
    pub fn mono_s16le(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            encoding: SampleEncoding::S16LE,
        }
    }

    /// Caps string advertised to clients that consume raw synthesized bytes.
    pub fn caps(&self) -> String {
        let format = match self.encoding {
            SampleEncoding::S16LE => "S16LE",
        };
        format!(
            "audio/x-raw,format={},channels={},rate={}",
            format, self.channels, self.sample_rate
        )
    }
}

/// Represents a text-to-speech voice in the catalog
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Voice {
    pub id: String,
    pub name: String,
    pub format: AudioFormat,
    pub languages: Vec<String>,
}

/// A voice resolved and ready for synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceHandle {
    pub key: String,
    pub sample_rate: u32,
    /// Intrinsic length scale of the voice; the caller's rate divides it.
    pub length_scale: f32,
    pub model: Option<PathBuf>,
    pub speaker: Option<i64>,
}

impl VoiceHandle {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::mono_s16le(self.sample_rate)
    }
}

/// How a backend treats the per-request volume parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeSupport {
    /// Volume is applied by the engine as a gain multiplier.
    Gain,
    /// Volume is accepted and deliberately ignored.
    Ignored,
}

/// Lazy, finite sequence of raw S16LE mono chunks.
pub type ChunkStream = Box<dyn Iterator<Item = Result<Vec<u8>>> + Send>;

/// Trait that all speech synthesis backends must implement.
/// This allows us to plug in different engines (Piper, eSpeak NG, ...)
pub trait SpeechBackend: Send + Sync {
    /// Returns the unique ID of the backend (e.g., "piper")
    fn id(&self) -> &'static str;

    /// Voice used when a request leaves the voice id empty.
    fn default_voice(&self) -> String;

    /// Resolves a voice id, failing with `VoiceNotFound` for unknown voices.
    fn load(&self, voice_id: &str) -> Result<VoiceHandle>;

    /// Starts synthesis of `text`. Not reentrant: callers serialize through
    /// `SynthesisLock` for as long as the returned stream is being drained.
    fn synthesize(
        &self,
        voice: &VoiceHandle,
        text: &str,
        length_scale: f32,
        volume: Option<f32>,
    ) -> Result<ChunkStream>;

    /// Returns the voice catalog
    fn list_voices(&self) -> Result<Vec<Voice>>;

    fn volume_support(&self) -> VolumeSupport {
        VolumeSupport::Ignored
    }
}

/// Builds the backend named in the settings.
pub fn from_settings(settings: &Settings) -> Result<Arc<dyn SpeechBackend>> {
    match settings.backend.as_str() {
        "espeak" => Ok(Arc::new(espeak::EspeakBackend::new(
            settings.espeak_binary.clone(),
            settings.synthesis_timeout(),
        ))),
        _ => Ok(Arc::new(piper::PiperBackend::new(
            settings.piper_binary.clone(),
            settings.voices_path()?,
            settings.default_voice.clone(),
        ))),
    }
}
