#![allow(dead_code)]

use speech_provider::backends::{ChunkStream, SpeechBackend, Voice, VoiceHandle, VolumeSupport};
use speech_provider::dispatcher::{Provider, ProviderEvent};
use speech_provider::pipeline::sink::SinkTarget;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

mockall::mock! {
    pub Backend {}
    impl SpeechBackend for Backend {
        fn id(&self) -> &'static str;
        fn default_voice(&self) -> String;
        fn load(&self, voice_id: &str) -> speech_provider::Result<VoiceHandle>;
        fn synthesize(
            &self,
            voice: &VoiceHandle,
            text: &str,
            length_scale: f32,
            volume: Option<f32>,
        ) -> speech_provider::Result<ChunkStream>;
        fn list_voices(&self) -> speech_provider::Result<Vec<Voice>>;
        fn volume_support(&self) -> VolumeSupport;
    }
}

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn handle(key: &str, length_scale: f32) -> VoiceHandle {
    VoiceHandle {
        key: key.to_string(),
        sample_rate: 22050,
        length_scale,
        model: None,
        speaker: None,
    }
}

/// Backend whose every voice loads and whose synthesis yields `chunks`,
/// sleeping `delay` before each one.
pub fn scripted_backend(chunks: Vec<Vec<u8>>, delay: Duration) -> MockBackend {
    let mut backend = MockBackend::new();
    backend.expect_default_voice().return_const("test-voice".to_string());
    backend.expect_load().returning(|key| Ok(handle(key, 1.0)));
    backend
        .expect_synthesize()
        .returning(move |_, _, _, _| Ok(paced(chunks.iter().cloned().map(Ok).collect(), delay)));
    backend
}

pub fn paced(chunks: Vec<speech_provider::Result<Vec<u8>>>, delay: Duration) -> ChunkStream {
    Box::new(chunks.into_iter().inspect(move |_| std::thread::sleep(delay)))
}

pub fn spawn(backend: MockBackend, workers: usize) -> (Provider, UnboundedReceiver<ProviderEvent>) {
    Provider::spawn(
        Arc::new(backend),
        workers,
        speech_provider::worker::SynthesisLock::new(),
    )
}

pub async fn next_event(events: &mut UnboundedReceiver<ProviderEvent>) -> ProviderEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for provider event")
        .expect("event channel closed")
}

pub async fn no_event(events: &mut UnboundedReceiver<ProviderEvent>, wait: Duration) {
    if let Ok(event) = tokio::time::timeout(wait, events.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}

pub async fn wait_until_idle(provider: &Provider) {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while provider.is_busy().await {
        assert!(tokio::time::Instant::now() < deadline, "provider never went idle");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// In-memory writer standing in for a client's file descriptor.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn target(&self) -> SinkTarget {
        SinkTarget::Stream(Box::new(self.clone()))
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
