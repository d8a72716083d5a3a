mod common;

use common::*;
use mockall::predicate::eq;
use speech_provider::backends::piper::PiperBackend;
use speech_provider::backends::SpeechBackend;
use speech_provider::dispatcher::{Provider, ProviderEvent};
use speech_provider::pipeline::sink::SinkTarget;
use speech_provider::service::voice_records;
use speech_provider::worker::{SpeechRequest, SynthesisLock};
use speech_provider::ProviderError;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

const SLOW: Duration = Duration::from_millis(30);

#[tokio::test]
async fn test_speak_emits_start_then_end() {
    let (provider, mut events) = spawn(scripted_backend(vec![vec![1, 0, 2, 0]; 3], Duration::ZERO), 1);
    let out = SharedBuffer::default();

    provider
        .speak(SpeechRequest::new(Some(7), "hello"), out.target())
        .await
        .unwrap();

    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechStart(7));
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechEnd(7));
    assert_eq!(out.bytes(), [1, 0, 2, 0].repeat(3));
    assert!(!provider.is_busy().await);
}

#[tokio::test]
async fn test_pool_exhausted_until_worker_returns() {
    let (provider, mut events) = spawn(scripted_backend(vec![vec![0; 64]; 20], SLOW), 1);

    provider
        .speak(SpeechRequest::new(Some(1), "first"), SharedBuffer::default().target())
        .await
        .unwrap();

    let refused = provider
        .speak(SpeechRequest::new(Some(2), "second"), SharedBuffer::default().target())
        .await;
    assert!(matches!(refused, Err(ProviderError::PoolExhausted)));

    provider.cancel(1).await.unwrap();
    loop {
        if next_event(&mut events).await == ProviderEvent::SpeechEnd(1) {
            break;
        }
    }

    provider
        .speak(SpeechRequest::new(Some(3), "third"), SharedBuffer::default().target())
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechStart(3));
}

#[tokio::test]
async fn test_cancel_before_completion() {
    let (provider, mut events) = spawn(scripted_backend(vec![vec![0; 64]; 50], SLOW), 1);

    provider
        .speak(SpeechRequest::new(Some(5), "long"), SharedBuffer::default().target())
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechStart(5));

    provider.cancel(5).await.unwrap();
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechEnd(5));
    assert!(!provider.is_busy().await);
    no_event(&mut events, Duration::from_millis(200)).await;

    // Cancelling again is a no-op
    provider.cancel(5).await.unwrap();
    no_event(&mut events, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_control_calls_for_unknown_task_are_noops() {
    let (provider, mut events) = spawn(scripted_backend(vec![vec![0; 8]], Duration::ZERO), 2);

    provider.pause(99).await.unwrap();
    provider.resume(99).await.unwrap();
    provider.cancel(99).await.unwrap();

    no_event(&mut events, Duration::from_millis(100)).await;
    let status = provider.status().await.unwrap();
    assert_eq!(status.idle, 2);
    assert_eq!(status.in_flight, 0);
}

#[tokio::test]
async fn test_pause_and_resume_keep_all_audio() {
    let chunk = vec![3, 0, 4, 0];
    let (provider, mut events) = spawn(scripted_backend(vec![chunk.clone(); 10], SLOW), 1);
    let out = SharedBuffer::default();

    provider
        .speak(SpeechRequest::new(Some(11), "paused"), out.target())
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechStart(11));

    provider.pause(11).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(provider.is_busy().await);
    provider.resume(11).await.unwrap();

    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechEnd(11));
    assert_eq!(out.bytes(), chunk.repeat(10));
}

#[tokio::test]
async fn test_unknown_voice_is_refused_before_audio() {
    let mut backend = MockBackend::new();
    backend
        .expect_load()
        .with(eq("missing"))
        .returning(|key| Err(ProviderError::VoiceNotFound(key.to_string())));
    backend.expect_synthesize().times(0);

    let (provider, mut events) = spawn(backend, 1);
    let result = provider
        .speak(
            SpeechRequest::new(Some(4), "hi").with_voice("missing"),
            SharedBuffer::default().target(),
        )
        .await;

    assert!(matches!(result, Err(ProviderError::VoiceNotFound(ref v)) if v == "missing"));
    assert!(!provider.is_busy().await);
    no_event(&mut events, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_synthesis_failure_still_ends_request() {
    let mut backend = MockBackend::new();
    backend.expect_default_voice().return_const("v".to_string());
    backend.expect_load().returning(|key| Ok(handle(key, 1.0)));
    backend.expect_synthesize().returning(|_, _, _, _| {
        Ok(paced(
            vec![
                Ok(vec![0; 32]),
                Err(ProviderError::SynthesisFailure("engine died".into())),
                Ok(vec![0; 32]),
            ],
            Duration::ZERO,
        ))
    });

    let (provider, mut events) = spawn(backend, 1);
    provider
        .speak(SpeechRequest::new(Some(9), "boom"), SharedBuffer::default().target())
        .await
        .unwrap();

    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechStart(9));
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechEnd(9));
    assert!(!provider.is_busy().await);
}

#[tokio::test]
async fn test_rate_divides_voice_length_scale() {
    let mut backend = MockBackend::new();
    backend.expect_load().returning(|key| Ok(handle(key, 1.2)));
    backend
        .expect_synthesize()
        .withf(|_, _, scale, volume| (scale - 0.6).abs() < 1e-6 && *volume == Some(0.5))
        .times(1)
        .returning(|_, _, _, _| Ok(paced(vec![Ok(vec![0; 8])], Duration::ZERO)));
    backend
        .expect_synthesize()
        .withf(|_, _, scale, _| (scale - 1.2).abs() < 1e-6)
        .times(1)
        .returning(|_, _, _, _| Ok(paced(vec![Ok(vec![0; 8])], Duration::ZERO)));

    let (provider, mut events) = spawn(backend, 1);

    let fast = SpeechRequest::new(Some(1), "fast")
        .with_voice("amy")
        .with_prosody(1.0, 2.0)
        .with_volume(0.5);
    provider.speak(fast, SharedBuffer::default().target()).await.unwrap();
    next_event(&mut events).await;
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechEnd(1));

    let invalid = SpeechRequest::new(Some(2), "normal")
        .with_voice("amy")
        .with_prosody(1.0, 0.0);
    provider.speak(invalid, SharedBuffer::default().target()).await.unwrap();
    next_event(&mut events).await;
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechEnd(2));
}

#[tokio::test]
async fn test_voice_loaded_once_per_worker() {
    let mut backend = MockBackend::new();
    backend
        .expect_load()
        .with(eq("a"))
        .times(1)
        .returning(|key| Ok(handle(key, 1.0)));
    backend
        .expect_load()
        .with(eq("b"))
        .times(1)
        .returning(|key| Ok(handle(key, 1.0)));
    backend
        .expect_synthesize()
        .returning(|_, _, _, _| Ok(paced(vec![Ok(vec![0; 8])], Duration::ZERO)));

    let (provider, mut events) = spawn(backend, 1);
    for (id, voice) in [(1, "a"), (2, "a"), (3, "b")] {
        provider
            .speak(
                SpeechRequest::new(Some(id), "again").with_voice(voice),
                SharedBuffer::default().target(),
            )
            .await
            .unwrap();
        assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechStart(id));
        assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechEnd(id));
    }
}

#[tokio::test]
async fn test_duplicate_task_id_is_rejected() {
    let (provider, mut events) = spawn(scripted_backend(vec![vec![0; 64]; 20], SLOW), 2);

    provider
        .speak(SpeechRequest::new(Some(1), "one"), SharedBuffer::default().target())
        .await
        .unwrap();
    let duplicate = provider
        .speak(SpeechRequest::new(Some(1), "again"), SharedBuffer::default().target())
        .await;
    assert!(matches!(duplicate, Err(ProviderError::DuplicateRequest(1))));
    assert_eq!(provider.status().await.unwrap().idle, 1);

    provider.cancel(1).await.unwrap();
    loop {
        if next_event(&mut events).await == ProviderEvent::SpeechEnd(1) {
            break;
        }
    }
}

#[tokio::test]
async fn test_synthesize_into_file_descriptor() {
    let (provider, mut events) = spawn(scripted_backend(vec![vec![5, 0, 6, 0]; 4], Duration::ZERO), 1);
    let mut file = tempfile::tempfile().unwrap();
    let fd: std::os::fd::OwnedFd = file.try_clone().unwrap().into();

    provider
        .speak(SpeechRequest::new(None, "to a file"), SinkTarget::from_fd(fd))
        .await
        .unwrap();
    wait_until_idle(&provider).await;

    // Untracked requests produce no signals
    no_event(&mut events, Duration::from_millis(100)).await;

    let mut written = Vec::new();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.read_to_end(&mut written).unwrap();
    assert_eq!(written, [5, 0, 6, 0].repeat(4));
}

#[tokio::test]
async fn test_multi_speaker_voices_are_listed_separately() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("en_US-libritts-high.onnx"), b"").unwrap();
    std::fs::write(
        dir.path().join("en_US-libritts-high.onnx.json"),
        r#"{
            "dataset": "libritts",
            "audio": { "sample_rate": 22050 },
            "language": { "code": "en_US", "name_native": "English" },
            "speaker_id_map": { "p1": 0, "p2": 1 }
        }"#,
    )
    .unwrap();

    let backend: Arc<dyn SpeechBackend> = Arc::new(PiperBackend::new(
        "piper".to_string(),
        dir.path().to_path_buf(),
        "en_US-libritts-high".to_string(),
    ));
    let (provider, _events) = Provider::spawn(backend, 1, SynthesisLock::new());

    let records = voice_records(&provider.voices().await.unwrap());
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].0, "libritts/p1 (English)");
    assert_eq!(records[0].1, "en_US-libritts-high#p1");
    assert_eq!(records[1].1, "en_US-libritts-high#p2");
    assert_eq!(records[1].2, vec!["en-US".to_string()]);
}

#[tokio::test]
async fn test_control_calls_after_natural_end_are_noops() {
    let (provider, mut events) = spawn(scripted_backend(vec![vec![1, 0]; 2], Duration::ZERO), 2);

    provider
        .speak(SpeechRequest::new(Some(21), "short"), SharedBuffer::default().target())
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechStart(21));
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechEnd(21));

    provider.pause(21).await.unwrap();
    provider.resume(21).await.unwrap();
    provider.cancel(21).await.unwrap();

    no_event(&mut events, Duration::from_millis(150)).await;
    let status = provider.status().await.unwrap();
    assert_eq!(status.idle, 2);
    assert_eq!(status.in_flight, 0);
}

/// Client descriptor whose reader has gone away.
struct ClosedPipe;

impl Write for ClosedPipe {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_sink_failure_ends_request_and_frees_worker() {
    let (provider, mut events) = spawn(scripted_backend(vec![vec![7, 0]; 40], Duration::ZERO), 1);

    provider
        .speak(
            SpeechRequest::new(Some(31), "nobody listening"),
            SinkTarget::Stream(Box::new(ClosedPipe)),
        )
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechStart(31));
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechEnd(31));

    let out = SharedBuffer::default();
    provider
        .speak(SpeechRequest::new(Some(32), "listening"), out.target())
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechStart(32));
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechEnd(32));
    assert_eq!(out.bytes(), [7, 0].repeat(40));
}

/// Client descriptor that stops reading until the test lets go.
struct StalledReader(std::sync::mpsc::Receiver<()>);

impl Write for StalledReader {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.0.recv();
        Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_cancel_with_stalled_client_releases_synthesis() {
    let (provider, mut events) = spawn(scripted_backend(vec![vec![0, 1]; 200], Duration::ZERO), 2);
    let (release, stalled) = std::sync::mpsc::channel();

    provider
        .speak(
            SpeechRequest::new(Some(41), "stuck"),
            SinkTarget::Stream(Box::new(StalledReader(stalled))),
        )
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechStart(41));

    // Let the producer fill the source and block behind the stalled write
    tokio::time::sleep(Duration::from_millis(100)).await;
    provider.cancel(41).await.unwrap();
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechEnd(41));

    let out = SharedBuffer::default();
    provider
        .speak(SpeechRequest::new(Some(42), "next"), out.target())
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechStart(42));
    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechEnd(42));
    assert_eq!(out.bytes(), [0, 1].repeat(200));

    drop(release);
}
