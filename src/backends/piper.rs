use super::{AudioFormat, ChunkStream, SpeechBackend, Voice, VoiceHandle, VolumeSupport, CHUNK_BYTES};
use crate::error::{ProviderError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use tracing::{debug, warn};

const CONFIG_SUFFIX: &str = ".onnx.json";
/// Trailing stderr bytes kept for failure reports.
const STDERR_TAIL: usize = 4096;

/// Subset of a Piper `<voice>.onnx.json` file that we care about.
#[derive(Debug, Deserialize)]
struct PiperConfig {
    #[serde(default)]
    dataset: Option<String>,
    audio: AudioSection,
    #[serde(default)]
    inference: InferenceSection,
    #[serde(default)]
    language: Option<LanguageSection>,
    #[serde(default)]
    speaker_id_map: BTreeMap<String, i64>,
}

#[derive(Debug, Deserialize)]
struct AudioSection {
    sample_rate: u32,
}

#[derive(Debug, Deserialize)]
struct InferenceSection {
    #[serde(default = "default_length_scale")]
    length_scale: f32,
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            length_scale: default_length_scale(),
        }
    }
}

fn default_length_scale() -> f32 {
    1.0
}

#[derive(Debug, Deserialize)]
struct LanguageSection {
    code: String,
    #[serde(default)]
    name_native: Option<String>,
}

impl PiperConfig {
    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            ProviderError::Io(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("{}: {}", path.display(), e),
            ))
        })
    }

    fn language_tag(&self) -> Option<String> {
        self.language.as_ref().map(|l| l.code.replace('_', "-"))
    }

    fn display_name(&self, key: &str) -> (String, String) {
        let dataset = self.dataset.clone().unwrap_or_else(|| key.replace('_', " "));
        let language = self
            .language
            .as_ref()
            .map(|l| l.name_native.clone().unwrap_or_else(|| l.code.clone()))
            .unwrap_or_else(|| "unknown".to_string());
        (dataset, language)
    }

    /// One entry per voice, or one per named speaker for multi-speaker models.
    fn catalog_entries(&self, key: &str) -> Vec<Voice> {
        let format = AudioFormat::mono_s16le(self.audio.sample_rate);
        let languages: Vec<String> = self.language_tag().into_iter().collect();
        let (dataset, language) = self.display_name(key);

        if self.speaker_id_map.is_empty() {
            return vec![Voice {
                id: key.to_string(),
                name: format!("{} ({})", dataset, language),
                format,
                languages,
            }];
        }

        self.speaker_id_map
            .keys()
            .map(|speaker| Voice {
                id: format!("{}#{}", key, speaker),
                name: format!("{}/{} ({})", dataset, speaker, language),
                format,
                languages: languages.clone(),
            })
            .collect()
    }
}

/// Splits `key#speaker` into its model key and optional speaker name.
fn split_speaker(voice_id: &str) -> (&str, Option<&str>) {
    match voice_id.split_once('#') {
        Some((key, speaker)) if !speaker.is_empty() => (key, Some(speaker)),
        Some((key, _)) => (key, None),
        None => (voice_id, None),
    }
}

pub struct PiperBackend {
    binary_path: String,
    models_dir: PathBuf,
    default_voice: String,
}

impl PiperBackend {
    pub fn new(binary_path: String, models_dir: PathBuf, default_voice: String) -> Self {
        Self {
            binary_path,
            models_dir,
            default_voice,
        }
    }

    fn find_model_files(&self, key: &str) -> Option<(PathBuf, PathBuf)> {
        if key.is_empty() || key.contains('/') || key.contains("..") {
            return None;
        }

        let onnx = self.models_dir.join(format!("{}.onnx", key));
        let config = self.models_dir.join(format!("{}{}", key, CONFIG_SUFFIX));

        if onnx.exists() && config.exists() {
            Some((onnx, config))
        } else {
            None
        }
    }
}

impl SpeechBackend for PiperBackend {
    fn id(&self) -> &'static str {
        "piper"
    }

    fn default_voice(&self) -> String {
        self.default_voice.clone()
    }

    fn load(&self, voice_id: &str) -> Result<VoiceHandle> {
        let voice_id = if voice_id.is_empty() {
            self.default_voice.as_str()
        } else {
            voice_id
        };
        let (key, speaker) = split_speaker(voice_id);

        let (onnx_path, config_path) = self
            .find_model_files(key)
            .ok_or_else(|| ProviderError::VoiceNotFound(voice_id.to_string()))?;
        let config = PiperConfig::read(&config_path)?;

        let speaker = match speaker {
            Some(name) => Some(
                *config
                    .speaker_id_map
                    .get(name)
                    .ok_or_else(|| ProviderError::VoiceNotFound(voice_id.to_string()))?,
            ),
            None => None,
        };

        debug!(voice = voice_id, sample_rate = config.audio.sample_rate, "Loaded piper voice");

        Ok(VoiceHandle {
            key: voice_id.to_string(),
            sample_rate: config.audio.sample_rate,
            length_scale: config.inference.length_scale,
            model: Some(onnx_path),
            speaker,
        })
    }

    fn synthesize(
        &self,
        voice: &VoiceHandle,
        text: &str,
        length_scale: f32,
        volume: Option<f32>,
    ) -> Result<ChunkStream> {
        let model = voice.model.as_ref().ok_or_else(|| {
            ProviderError::SynthesisFailure(format!("voice {} has no model file", voice.key))
        })?;

        if volume.is_some() {
            debug!(voice = %voice.key, "piper does not support volume; ignoring");
        }

        let mut command = Command::new(&self.binary_path);
        command
            .arg("--model")
            .arg(model)
            .arg("--output_raw")
            .arg("--length_scale")
            .arg(format!("{:.3}", length_scale));
        if let Some(speaker) = voice.speaker {
            command.arg("--speaker").arg(speaker.to_string());
        }

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ProviderError::SynthesisFailure(format!(
                    "failed to start {}: {}",
                    self.binary_path, e
                ))
            })?;

        // Piper treats each input line as an utterance
        let line = format!("{}\n", text.replace(['\r', '\n'], " "));
        if let Some(mut stdin) = child.stdin.take() {
            // Fed from its own thread so a long utterance cannot deadlock against
            // piper blocking on a full stdout pipe.
            std::thread::spawn(move || {
                if let Err(e) = stdin.write_all(line.as_bytes()) {
                    debug!("piper stdin closed early: {}", e);
                }
            });
        }

        // Piper logs every sentence; an unread stderr pipe would stall its stdout
        let stderr = child.stderr.take().map(drain_stderr);

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProviderError::SynthesisFailure(
                    "piper stdout unavailable".to_string(),
                ));
            }
        };

        Ok(Box::new(PiperStream {
            child,
            stdout,
            stderr,
            finished: false,
        }))
    }

    fn list_voices(&self) -> Result<Vec<Voice>> {
        let mut voices = Vec::new();

        if !self.models_dir.exists() {
            return Ok(voices);
        }

        for entry in std::fs::read_dir(&self.models_dir)?.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(key) = file_name.strip_suffix(CONFIG_SUFFIX) else {
                continue;
            };

            match PiperConfig::read(&path) {
                Ok(config) => voices.extend(config.catalog_entries(key)),
                Err(e) => warn!("Skipping unreadable piper voice config {}: {}", path.display(), e),
            }
        }

        voices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(voices)
    }

    fn volume_support(&self) -> VolumeSupport {
        VolumeSupport::Ignored
    }
}

/// Reads a child's stderr to the end, returning its last `STDERR_TAIL` bytes.
fn drain_stderr(mut pipe: ChildStderr) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut tail = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > 2 * STDERR_TAIL {
                        tail.drain(..tail.len() - STDERR_TAIL);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let start = tail.len().saturating_sub(STDERR_TAIL);
        String::from_utf8_lossy(&tail[start..]).into_owned()
    })
}

/// Streams raw PCM from a running piper process.
struct PiperStream {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    finished: bool,
}

impl PiperStream {
    fn finish(&mut self) -> Option<Result<Vec<u8>>> {
        self.finished = true;
        match self.child.wait() {
            Ok(status) if status.success() => None,
            Ok(status) => {
                let stderr = self
                    .stderr
                    .take()
                    .and_then(|reader| reader.join().ok())
                    .unwrap_or_default();
                Some(Err(ProviderError::SynthesisFailure(format!(
                    "piper exited with {}: {}",
                    status,
                    stderr.trim()
                ))))
            }
            Err(e) => Some(Err(ProviderError::SynthesisFailure(e.to_string()))),
        }
    }
}

impl Iterator for PiperStream {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut buf = vec![0u8; CHUNK_BYTES];
        loop {
            match self.stdout.read(&mut buf) {
                Ok(0) => return self.finish(),
                Ok(n) => {
                    buf.truncate(n);
                    return Some(Ok(buf));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(ProviderError::SynthesisFailure(e.to_string())));
                }
            }
        }
    }
}

impl Drop for PiperStream {
    fn drop(&mut self) {
        if !self.finished {
            // Stream abandoned mid-utterance (request cancelled)
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
