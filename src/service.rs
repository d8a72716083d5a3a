use crate::backends::Voice;
use crate::dispatcher::{Provider, ProviderEvent};
use crate::pipeline::sink::SinkTarget;
use crate::worker::SpeechRequest;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};
use zbus::{interface, message::Header, Connection, SignalContext};

pub const INTERFACE: &str = "org.freedesktop.Speech.Provider";

/// `GetVoices` entry: (name, id, languages).
pub type VoiceRecord = (String, String, Vec<String>);
/// `Voices` property entry: (name, id, caps, features, languages).
pub type VoiceProperty = (String, String, String, u64, Vec<String>);

pub fn voice_records(voices: &[Voice]) -> Vec<VoiceRecord> {
    voices
        .iter()
        .map(|v| (v.name.clone(), v.id.clone(), v.languages.clone()))
        .collect()
}

pub fn voice_properties(voices: &[Voice]) -> Vec<VoiceProperty> {
    voices
        .iter()
        .map(|v| (v.name.clone(), v.id.clone(), v.format.caps(), 0, v.languages.clone()))
        .collect()
}

pub struct SpeechProvider {
    provider: Provider,
}

impl SpeechProvider {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }
}

#[interface(name = "org.freedesktop.Speech.Provider")]
impl SpeechProvider {
    #[zbus(name = "Speak")]
    async fn speak(
        &self,
        #[zbus(header)] header: Header<'_>,
        task_id: u64,
        utterance: String,
        voice_id: String,
        pitch: f64,
        rate: f64,
        volume: f64,
    ) -> zbus::fdo::Result<()> {
        info!(
            task = task_id,
            sender = ?header.sender().map(|s| s.as_str()),
            voice = %voice_id,
            "Received speak request"
        );
        let request = SpeechRequest::new(Some(task_id), utterance)
            .with_voice(voice_id)
            .with_prosody(pitch as f32, rate as f32)
            .with_volume(volume as f32);
        self.provider.speak(request, SinkTarget::Device).await?;
        Ok(())
    }

    #[zbus(name = "Synthesize")]
    async fn synthesize(
        &self,
        fd: zbus::zvariant::OwnedFd,
        utterance: String,
        voice_id: String,
        pitch: f64,
        rate: f64,
        is_ssml: bool,
    ) -> zbus::fdo::Result<()> {
        info!(voice = %voice_id, "Received synthesize request");
        if is_ssml {
            warn!("SSML markup is not interpreted; synthesizing as plain text");
        }
        let request = SpeechRequest::new(None, utterance)
            .with_voice(voice_id)
            .with_prosody(pitch as f32, rate as f32);
        let fd: std::os::fd::OwnedFd = fd.into();
        self.provider.speak(request, SinkTarget::from_fd(fd)).await?;
        Ok(())
    }

    #[zbus(name = "Pause")]
    async fn pause(&self, task_id: u64) -> zbus::fdo::Result<()> {
        self.provider.pause(task_id).await?;
        Ok(())
    }

    #[zbus(name = "Resume")]
    async fn resume(&self, task_id: u64) -> zbus::fdo::Result<()> {
        self.provider.resume(task_id).await?;
        Ok(())
    }

    #[zbus(name = "Cancel")]
    async fn cancel(&self, task_id: u64) -> zbus::fdo::Result<()> {
        self.provider.cancel(task_id).await?;
        Ok(())
    }

    #[zbus(name = "GetVoices")]
    async fn get_voices(&self) -> zbus::fdo::Result<Vec<VoiceRecord>> {
        let voices = self.provider.voices().await?;
        Ok(voice_records(&voices))
    }

    #[zbus(property, name = "Voices")]
    async fn voices(&self) -> zbus::fdo::Result<Vec<VoiceProperty>> {
        let voices = self.provider.voices().await?;
        Ok(voice_properties(&voices))
    }

    #[zbus(signal, name = "SpeechStart")]
    async fn speech_start(ctxt: &SignalContext<'_>, task_id: u64) -> zbus::Result<()>;

    #[zbus(signal, name = "SpeechEnd")]
    async fn speech_end(ctxt: &SignalContext<'_>, task_id: u64) -> zbus::Result<()>;

    /// Word boundaries are not reported by either engine; declared so clients
    /// that introspect for it find the full interface.
    #[zbus(signal, name = "SpeechRangeStart")]
    async fn speech_range_start(
        ctxt: &SignalContext<'_>,
        task_id: u64,
        start: u64,
        end: u64,
    ) -> zbus::Result<()>;

    #[zbus(signal, name = "VoicesChanged")]
    async fn emit_voices_changed(ctxt: &SignalContext<'_>) -> zbus::Result<()>;
}

/// Relays control loop events as D-Bus signals until the loop goes away.
pub async fn forward_events(conn: Connection, path: String, mut events: UnboundedReceiver<ProviderEvent>) {
    let ctxt = match SignalContext::new(&conn, path.as_str()) {
        Ok(ctxt) => ctxt,
        Err(e) => {
            error!("Invalid object path {}: {}", path, e);
            return;
        }
    };

    while let Some(event) = events.recv().await {
        debug!("Emitting {:?}", event);
        let result = match event {
            ProviderEvent::SpeechStart(task) => SpeechProvider::speech_start(&ctxt, task).await,
            ProviderEvent::SpeechEnd(task) => SpeechProvider::speech_end(&ctxt, task).await,
        };
        if let Err(e) = result {
            warn!("Failed to emit {:?}: {}", event, e);
        }
    }
}

async fn voice_ids(provider: &Provider) -> Option<BTreeSet<String>> {
    match provider.voices().await {
        Ok(voices) => Some(voices.into_iter().map(|v| v.id).collect()),
        Err(e) => {
            warn!("Failed to list voices: {}", e);
            None
        }
    }
}

/// Polls the catalog and emits `VoicesChanged` when its ids change.
pub async fn watch_voices(conn: Connection, path: String, provider: Provider, period: Duration) {
    let ctxt = match SignalContext::new(&conn, path.as_str()) {
        Ok(ctxt) => ctxt,
        Err(e) => {
            error!("Invalid object path {}: {}", path, e);
            return;
        }
    };

    let mut known = voice_ids(&provider).await.unwrap_or_default();
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(current) = voice_ids(&provider).await else {
            continue;
        };
        if current != known {
            info!(voices = current.len(), "Voice catalog changed");
            known = current;
            if let Err(e) = SpeechProvider::emit_voices_changed(&ctxt).await {
                warn!("Failed to emit VoicesChanged: {}", e);
            }
        }
    }
}

/// Returns once a full idle window passes with no worker leased.
pub async fn idle_shutdown(provider: &Provider, window: Duration) {
    loop {
        tokio::time::sleep(window).await;
        if !provider.is_busy().await {
            info!("Idle for {:?}, shutting down", window);
            return;
        }
        debug!("Still speaking; staying up");
    }
}
