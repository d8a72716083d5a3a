use super::{AudioFormat, ChunkStream, SpeechBackend, Voice, VoiceHandle, VolumeSupport, CHUNK_BYTES};
use crate::error::{ProviderError, Result};
use std::io::{Cursor, Read, Write};
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Words per minute eSpeak NG speaks at rate 1.0
const NORMAL_RATE: f32 = 175.0;
const SAMPLE_RATE: u32 = 22050;
const DEFAULT_VOICE: &str = "en";

pub struct EspeakBackend {
    binary_path: String,
    timeout: Duration,
    /// Last catalog listed; `load` checks ids against it without running espeak.
    catalog: Mutex<Option<Vec<Voice>>>,
}

impl EspeakBackend {
    pub fn new(binary_path: String, timeout: Duration) -> Self {
        Self {
            binary_path,
            timeout,
            catalog: Mutex::new(None),
        }
    }

    fn is_known(&self, voice_id: &str) -> Result<bool> {
        let cached = self
            .catalog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|voices| voices.iter().any(|v| v.id == voice_id));
        match cached {
            Some(known) => Ok(known),
            None => Ok(self.list_voices()?.iter().any(|v| v.id == voice_id)),
        }
    }

    fn run(&self, args: &[String], input: Option<&str>) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.binary_path)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ProviderError::SynthesisFailure(format!(
                    "failed to start {}: {}",
                    self.binary_path, e
                ))
            })?;

        // Drain both pipes concurrently so neither can fill up while we wait
        let mut stdout = child.stdout.take();
        let reader = std::thread::spawn(move || {
            let mut data = Vec::new();
            if let Some(out) = stdout.as_mut() {
                let _ = out.read_to_end(&mut data);
            }
            data
        });
        let mut stderr = child.stderr.take();
        let errors = std::thread::spawn(move || {
            let mut text = String::new();
            if let Some(err) = stderr.as_mut() {
                let _ = err.read_to_string(&mut text);
            }
            text
        });

        if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
            if let Err(e) = stdin.write_all(text.as_bytes()) {
                debug!("espeak stdin closed early: {}", e);
            }
            // stdin is dropped here, closing the pipe
        }

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                // Timeout occurred, kill the process
                let _ = child.kill();
                let _ = child.wait();
                let _ = reader.join();
                let _ = errors.join();
                return Err(ProviderError::SynthesisFailure(format!(
                    "{} timed out after {:?}",
                    self.binary_path, self.timeout
                )));
            }
        };

        let data = reader.join().unwrap_or_default();
        if status.success() {
            Ok(data)
        } else {
            let stderr = errors.join().unwrap_or_default();
            Err(ProviderError::SynthesisFailure(format!(
                "espeak error: {}",
                stderr.trim()
            )))
        }
    }
}

/// Parses the table printed by `espeak-ng --voices`.
pub fn parse_voice_list(output: &str) -> Vec<Voice> {
    output
        .lines()
        .filter(|line| !line.trim_start().starts_with("Pty"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return None;
            }

            let mut languages = vec![fields[1].to_string()];
            // Trailing "(xx 5)" groups list additional languages
            languages.extend(
                fields[5..]
                    .iter()
                    .map(|f| f.trim_start_matches('('))
                    .filter(|f| !f.is_empty() && !f.ends_with(')'))
                    .map(str::to_string),
            );

            Some(Voice {
                id: fields[1].to_string(),
                name: fields[3].replace('_', " "),
                format: AudioFormat::mono_s16le(SAMPLE_RATE),
                languages,
            })
        })
        .collect()
}

fn words_per_minute(length_scale: f32) -> u32 {
    let scale = if length_scale.is_finite() && length_scale > 0.0 {
        length_scale
    } else {
        1.0
    };
    (NORMAL_RATE / scale).round().clamp(80.0, 450.0) as u32
}

fn amplitude(volume: f32) -> u32 {
    (volume * 100.0).round().clamp(0.0, 200.0) as u32
}

/// Extracts S16LE bytes from espeak's WAV output. Streaming output carries a
/// placeholder data length, so decoding stops at the first short read.
fn wav_to_raw(wav: Vec<u8>) -> Result<(u32, Vec<u8>)> {
    let reader = hound::WavReader::new(Cursor::new(wav))
        .map_err(|e| ProviderError::SynthesisFailure(format!("invalid espeak output: {}", e)))?;
    let sample_rate = reader.spec().sample_rate;

    let mut raw = Vec::new();
    for sample in reader.into_samples::<i16>() {
        match sample {
            Ok(s) => raw.extend_from_slice(&s.to_le_bytes()),
            Err(_) => break,
        }
    }
    Ok((sample_rate, raw))
}

impl SpeechBackend for EspeakBackend {
    fn id(&self) -> &'static str {
        "espeak-ng"
    }

    fn default_voice(&self) -> String {
        DEFAULT_VOICE.to_string()
    }

    fn load(&self, voice_id: &str) -> Result<VoiceHandle> {
        let voice_id = if voice_id.is_empty() {
            DEFAULT_VOICE
        } else {
            voice_id
        };

        if !self.is_known(voice_id)? {
            return Err(ProviderError::VoiceNotFound(voice_id.to_string()));
        }

        Ok(VoiceHandle {
            key: voice_id.to_string(),
            sample_rate: SAMPLE_RATE,
            length_scale: 1.0,
            model: None,
            speaker: None,
        })
    }

    fn synthesize(
        &self,
        voice: &VoiceHandle,
        text: &str,
        length_scale: f32,
        volume: Option<f32>,
    ) -> Result<ChunkStream> {
        let mut args = vec![
            "--stdout".to_string(),
            "--stdin".to_string(),
            "-v".to_string(),
            voice.key.clone(),
            "-s".to_string(),
            words_per_minute(length_scale).to_string(),
        ];
        if let Some(volume) = volume {
            args.push("-a".to_string());
            args.push(amplitude(volume).to_string());
        }

        debug!(voice = %voice.key, ?args, "Running espeak-ng");
        let wav = self.run(&args, Some(text))?;
        let (sample_rate, raw) = wav_to_raw(wav)?;
        if sample_rate != voice.sample_rate {
            warn!(
                "espeak produced {} Hz audio, pipeline expects {} Hz",
                sample_rate, voice.sample_rate
            );
        }

        let chunks: Vec<Result<Vec<u8>>> = raw.chunks(CHUNK_BYTES).map(|c| Ok(c.to_vec())).collect();
        Ok(Box::new(chunks.into_iter()))
    }

    fn list_voices(&self) -> Result<Vec<Voice>> {
        let out = self.run(&["--voices".to_string()], None)?;
        let voices = parse_voice_list(&String::from_utf8_lossy(&out));
        *self.catalog.lock().unwrap_or_else(PoisonError::into_inner) = Some(voices.clone());
        Ok(voices)
    }

    fn volume_support(&self) -> VolumeSupport {
        VolumeSupport::Gain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOICES: &str = "Pty Language       Age/Gender VoiceName          File                 Other Languages
 5  af              --/M      Afrikaans          gmw/af
 2  en-gb           --/M      English_(Great_Britain) gmw/en           (en 2)
 5  en-us           --/M      English_(America)  gmw/en-US            (en 3)
";

    #[test]
    fn test_parse_voice_list() {
        let voices = parse_voice_list(VOICES);
        assert_eq!(voices.len(), 3);
        assert_eq!(voices[0].id, "af");
        assert_eq!(voices[0].name, "Afrikaans");
        assert_eq!(voices[1].name, "English (Great Britain)");
        assert_eq!(voices[1].languages, vec!["en-gb".to_string(), "en".to_string()]);
        assert_eq!(voices[2].format.sample_rate, 22050);
    }

    #[test]
    fn test_rate_and_volume_mapping() {
        assert_eq!(words_per_minute(1.0), 175);
        assert_eq!(words_per_minute(0.5), 350);
        assert_eq!(words_per_minute(0.0), 175);
        assert_eq!(words_per_minute(100.0), 80);
        assert_eq!(amplitude(1.0), 100);
        assert_eq!(amplitude(5.0), 200);
    }

    #[test]
    fn test_wav_to_raw_tolerates_truncated_data() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for s in [1i16, -2, 3] {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        let mut wav = cursor.into_inner();
        // Append half a sample to mimic an unterminated stream
        wav.push(0x7f);

        let (rate, raw) = wav_to_raw(wav).unwrap();
        assert_eq!(rate, 22050);
        assert_eq!(raw, vec![1, 0, 0xfe, 0xff, 3, 0]);
    }

    #[test]
    fn test_load_uses_cached_catalog() {
        let backend = EspeakBackend::new("/nonexistent/espeak-ng".into(), Duration::from_secs(1));
        assert!(matches!(backend.load("en-us"), Err(ProviderError::SynthesisFailure(_))));

        *backend.catalog.lock().unwrap() = Some(parse_voice_list(VOICES));
        assert_eq!(backend.load("en-us").unwrap().key, "en-us");
        assert!(matches!(backend.load("klingon"), Err(ProviderError::VoiceNotFound(_))));
    }

    #[test]
    #[cfg(unix)]
    fn test_chatty_stderr_is_drained_before_timeout() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-espeak");
        std::fs::write(
            &script,
            "#!/bin/sh\nhead -c 204800 /dev/zero | tr '\\0' e >&2\necho 'unknown voice' >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = EspeakBackend::new(script.to_string_lossy().into_owned(), Duration::from_secs(10));
        match backend.list_voices() {
            Err(ProviderError::SynthesisFailure(message)) => {
                assert!(message.contains("unknown voice"));
                assert!(!message.contains("timed out"));
            }
            other => panic!("unexpected result: {:?}", other.map(|v| v.len())),
        }
    }
}
