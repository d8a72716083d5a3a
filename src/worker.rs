use crate::backends::{SpeechBackend, VoiceHandle};
use crate::error::Result;
use crate::pipeline::sink::SinkTarget;
use crate::pipeline::{AudioPipeline, Bus, BusEnvelope, BusMessage, PipelineState, SourceFeed, WorkerId};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing::{debug, error, info, warn};

/// Serializes access to the synthesis engine across all workers.
///
/// Engines are not reentrant, so one guard is held for the whole time a
/// producer drains its chunk stream.
#[derive(Clone, Default)]
pub struct SynthesisLock(Arc<Mutex<()>>);

impl SynthesisLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One utterance to synthesize.
#[derive(Debug, Clone)]
pub struct SpeechRequest {
    /// Client task id; `None` for untracked requests.
    pub id: Option<u64>,
    pub text: String,
    /// Empty selects the backend's default voice.
    pub voice_id: String,
    pub pitch: f32,
    pub rate: f32,
    pub volume: Option<f32>,
}

impl SpeechRequest {
    pub fn new(id: Option<u64>, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            voice_id: String::new(),
            pitch: 1.0,
            rate: 1.0,
            volume: None,
        }
    }

    pub fn with_voice(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = voice_id.into();
        self
    }

    pub fn with_prosody(mut self, pitch: f32, rate: f32) -> Self {
        self.pitch = pitch;
        self.rate = rate;
        self
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Rate as a speed multiplier; invalid values mean normal speed.
    pub fn effective_rate(&self) -> f32 {
        if self.rate.is_finite() && self.rate > 0.0 {
            self.rate
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    Start(WorkerId),
    Done(WorkerId),
}

/// Remembers the last voice a worker loaded.
#[derive(Debug, Default)]
pub struct VoiceCache {
    entry: Option<(String, VoiceHandle)>,
}

impl VoiceCache {
    pub fn key(&self) -> Option<&str> {
        self.entry.as_ref().map(|(key, _)| key.as_str())
    }

    /// Returns the cached handle for `key`, loading (and replacing) it on a miss.
    pub fn get_or_load<F>(&mut self, key: &str, load: F) -> Result<VoiceHandle>
    where
        F: FnOnce(&str) -> Result<VoiceHandle>,
    {
        if let Some((_, handle)) = self.entry.as_ref().filter(|(cached, _)| cached == key) {
            return Ok(handle.clone());
        }

        self.entry = None;
        let handle = load(key)?;
        self.entry = Some((key.to_string(), handle.clone()));
        Ok(handle)
    }
}

/// A pipeline plus the voice state needed to feed it.
pub struct SynthWorker {
    id: WorkerId,
    pipeline: AudioPipeline,
    backend: Arc<dyn SpeechBackend>,
    lock: SynthesisLock,
    voices: VoiceCache,
}

impl SynthWorker {
    pub fn new(id: WorkerId, backend: Arc<dyn SpeechBackend>, lock: SynthesisLock, bus: Bus) -> Self {
        Self {
            id,
            pipeline: AudioPipeline::new(id, bus),
            backend,
            lock,
            voices: VoiceCache::default(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> PipelineState {
        self.pipeline.state()
    }

    pub fn is_idle(&self) -> bool {
        !self.pipeline.has_source()
    }

    pub fn cached_voice(&self) -> Option<&str> {
        self.voices.key()
    }

    /// Resolves the voice, starts the pipeline and hands synthesis to a
    /// producer thread. Voice errors surface here, before any audio flows.
    pub fn speak(&mut self, request: &SpeechRequest, sink: SinkTarget) -> Result<()> {
        let key = if request.voice_id.is_empty() {
            self.backend.default_voice()
        } else {
            request.voice_id.clone()
        };

        let backend = self.backend.clone();
        let voice = self.voices.get_or_load(&key, |k| backend.load(k))?;

        let feed = self.pipeline.attach(voice.format(), request.pitch, sink)?;

        let producer = Producer {
            worker: self.id,
            backend,
            lock: self.lock.clone(),
            length_scale: voice.length_scale / request.effective_rate(),
            voice,
            text: request.text.clone(),
            volume: request.volume,
            feed,
        };

        let spawned = thread::Builder::new()
            .name(format!("synth-{}", self.id))
            .spawn(move || producer.run());
        if let Err(e) = spawned {
            self.pipeline.detach_and_reset();
            return Err(e.into());
        }
        Ok(())
    }

    pub fn pause(&mut self) -> bool {
        self.pipeline.pause()
    }

    pub fn resume(&mut self) -> bool {
        self.pipeline.resume()
    }

    /// Stops the current utterance. Yields `Done` if anything was playing.
    pub fn cancel(&mut self) -> Option<WorkerEvent> {
        self.reset()
    }

    /// Reacts to a message from this worker's streaming thread.
    pub fn handle_bus(&mut self, envelope: BusEnvelope) -> Option<WorkerEvent> {
        if !self.pipeline.accepts(&envelope) {
            debug!(
                worker = self.id,
                generation = envelope.generation,
                "Ignoring stale pipeline message {:?}",
                envelope.message
            );
            return None;
        }

        match envelope.message {
            BusMessage::Started => Some(WorkerEvent::Start(self.id)),
            BusMessage::Eos => {
                debug!(worker = self.id, "End of stream");
                self.reset()
            }
            BusMessage::Error { stage, message } => {
                error!(worker = self.id, stage, "Pipeline error: {}", message);
                self.reset()
            }
        }
    }

    fn reset(&mut self) -> Option<WorkerEvent> {
        self.pipeline
            .detach_and_reset()
            .then_some(WorkerEvent::Done(self.id))
    }
}

/// Runs synthesis for one request on its own thread.
struct Producer {
    worker: WorkerId,
    backend: Arc<dyn SpeechBackend>,
    lock: SynthesisLock,
    voice: VoiceHandle,
    text: String,
    length_scale: f32,
    volume: Option<f32>,
    feed: SourceFeed,
}

impl Producer {
    fn run(self) {
        let _guard = self.lock.hold();
        info!(
            worker = self.worker,
            voice = %self.voice.key,
            length_scale = self.length_scale,
            "Synthesizing {} chars",
            self.text.chars().count()
        );

        let stream = match self
            .backend
            .synthesize(&self.voice, &self.text, self.length_scale, self.volume)
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(worker = self.worker, "Synthesis failed to start: {}", e);
                self.feed.send(Err(e));
                return;
            }
        };

        // The guard is dropped on every return, including cancellation
        for chunk in stream {
            let failed = chunk.is_err();
            if !self.feed.send(chunk) {
                debug!(worker = self.worker, "Pipeline detached; abandoning synthesis");
                return;
            }
            if failed {
                return;
            }
        }
        debug!(worker = self.worker, "Synthesis complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;

    fn handle(key: &str) -> VoiceHandle {
        VoiceHandle {
            key: key.to_string(),
            sample_rate: 22050,
            length_scale: 1.0,
            model: None,
            speaker: None,
        }
    }

    #[test]
    fn test_voice_cache_reuses_matching_voice() {
        let mut cache = VoiceCache::default();
        let mut loads = 0;

        for _ in 0..3 {
            cache
                .get_or_load("en_US-amy", |k| {
                    loads += 1;
                    Ok(handle(k))
                })
                .unwrap();
        }
        assert_eq!(loads, 1);
        assert_eq!(cache.key(), Some("en_US-amy"));
    }

    #[test]
    fn test_voice_cache_reloads_on_mismatch_and_clears_on_failure() {
        let mut cache = VoiceCache::default();
        cache.get_or_load("a", |k| Ok(handle(k))).unwrap();
        cache.get_or_load("b", |k| Ok(handle(k))).unwrap();
        assert_eq!(cache.key(), Some("b"));

        let err = cache
            .get_or_load("missing", |k| Err(ProviderError::VoiceNotFound(k.to_string())))
            .unwrap_err();
        assert!(matches!(err, ProviderError::VoiceNotFound(_)));
        assert_eq!(cache.key(), None);
    }

    #[test]
    fn test_effective_rate() {
        let request = SpeechRequest::new(None, "hi").with_prosody(1.0, 2.0);
        assert_eq!(request.effective_rate(), 2.0);
        let request = request.with_prosody(1.0, 0.0);
        assert_eq!(request.effective_rate(), 1.0);
        let request = request.with_prosody(1.0, f32::INFINITY);
        assert_eq!(request.effective_rate(), 1.0);
    }

    #[test]
    fn test_synthesis_lock_survives_poison() {
        let lock = SynthesisLock::new();
        let poisoned = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoned.hold();
            panic!("engine blew up");
        })
        .join();
        drop(lock.hold());
    }
}
