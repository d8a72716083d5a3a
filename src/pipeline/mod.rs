//! Per-worker audio pipeline: source → parse → convert → pitch → sink.
//!
//! The pipeline itself lives in the control loop. Audio is pumped on a
//! dedicated streaming thread that reports back over the bus, tagged with the
//! generation it was started for so late messages from a torn-down run can be
//! told apart from the current one.

pub mod sink;
pub mod stages;

use crate::backends::AudioFormat;
use crate::error::{ProviderError, Result};
use sink::{AudioSink, SinkTarget};
use stages::{AudioConvert, PitchShift, RawAudioParse};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, warn};

pub type WorkerId = usize;

/// Chunks buffered between a producer and its pipeline.
const SOURCE_CAPACITY: usize = 16;
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const SEND_RETRY: Duration = Duration::from_millis(5);

const FLOW_PLAYING: u8 = 0;
const FLOW_PAUSED: u8 = 1;
const FLOW_FLUSHING: u8 = 2;

type SourceReceiver = Receiver<Result<Vec<u8>>>;

/// Producer end of a pipeline's source stage. Dropping it marks end of stream.
pub struct SourceFeed {
    tx: SyncSender<Result<Vec<u8>>>,
    flow: Arc<AtomicU8>,
}

impl SourceFeed {
    /// True once the pipeline this feed was attached to has been reset.
    pub fn is_cancelled(&self) -> bool {
        self.flow.load(Ordering::Acquire) == FLOW_FLUSHING
    }

    /// Queues a chunk, waiting while the source is full. Returns false once
    /// the pipeline stops accepting audio, even when its streaming thread is
    /// stuck inside a sink write and no longer draining the source.
    pub fn send(&self, chunk: Result<Vec<u8>>) -> bool {
        let mut chunk = chunk;
        loop {
            if self.is_cancelled() {
                return false;
            }
            match self.tx.try_send(chunk) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    chunk = back;
                    thread::sleep(SEND_RETRY);
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Paused,
    Resetting,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Resetting)
                | (Paused, Resetting)
                | (Resetting, Idle)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Started,
    Eos,
    Error { stage: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusEnvelope {
    pub worker: WorkerId,
    pub generation: u64,
    pub message: BusMessage,
}

pub type Bus = UnboundedSender<BusEnvelope>;

struct AttachedSource {
    flow: Arc<AtomicU8>,
}

pub struct AudioPipeline {
    worker: WorkerId,
    state: PipelineState,
    pitch: f32,
    generation: u64,
    bus: Bus,
    source: Option<AttachedSource>,
    #[cfg(test)]
    trace: Vec<(PipelineState, PipelineState)>,
}

impl AudioPipeline {
    pub fn new(worker: WorkerId, bus: Bus) -> Self {
        Self {
            worker,
            state: PipelineState::Idle,
            pitch: 1.0,
            generation: 0,
            bus,
            source: None,
            #[cfg(test)]
            trace: Vec::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    fn transition(&mut self, next: PipelineState) {
        if !self.state.can_transition_to(next) {
            error!(
                worker = self.worker,
                "Invalid pipeline transition {:?} -> {:?}", self.state, next
            );
        }
        #[cfg(test)]
        self.trace.push((self.state, next));
        self.state = next;
    }

    /// Links a fresh source into the pipeline and starts streaming into `sink`.
    /// The returned feed is the only way to push audio into this run.
    pub fn attach(&mut self, format: AudioFormat, pitch: f32, sink: SinkTarget) -> Result<SourceFeed> {
        if self.source.is_some() || self.state != PipelineState::Idle {
            return Err(ProviderError::PipelineBusy);
        }

        let (tx, source) = std::sync::mpsc::sync_channel(SOURCE_CAPACITY);

        let shifter = PitchShift::new(pitch);
        self.pitch = shifter.ratio();
        self.generation += 1;

        let flow = Arc::new(AtomicU8::new(FLOW_PLAYING));
        let stream = StreamThread {
            worker: self.worker,
            generation: self.generation,
            bus: self.bus.clone(),
            flow: flow.clone(),
            parse: RawAudioParse::new(format.channels, format.sample_rate),
            pitch: shifter,
            format,
            source,
        };

        thread::Builder::new()
            .name(format!("pipeline-{}", self.worker))
            .spawn(move || stream.run(sink))?;

        self.source = Some(AttachedSource { flow: flow.clone() });
        self.transition(PipelineState::Running);
        debug!(
            worker = self.worker,
            generation = self.generation,
            pitch = self.pitch,
            caps = %format.caps(),
            "Pipeline started"
        );
        Ok(SourceFeed { tx, flow })
    }

    pub fn pause(&mut self) -> bool {
        match (&self.source, self.state) {
            (Some(source), PipelineState::Running) => {
                source.flow.store(FLOW_PAUSED, Ordering::Release);
                self.transition(PipelineState::Paused);
                true
            }
            _ => false,
        }
    }

    pub fn resume(&mut self) -> bool {
        match (&self.source, self.state) {
            (Some(source), PipelineState::Paused) => {
                source.flow.store(FLOW_PLAYING, Ordering::Release);
                self.transition(PipelineState::Running);
                true
            }
            _ => false,
        }
    }

    /// Tears down the current source and returns to `Idle` with pitch reset.
    /// Returns false when nothing was attached.
    pub fn detach_and_reset(&mut self) -> bool {
        let Some(source) = self.source.take() else {
            return false;
        };

        self.transition(PipelineState::Resetting);
        source.flow.store(FLOW_FLUSHING, Ordering::Release);
        self.pitch = 1.0;
        self.transition(PipelineState::Idle);
        debug!(
            worker = self.worker,
            generation = self.generation,
            "Pipeline reset"
        );
        true
    }

    /// Whether a bus message belongs to the run currently attached.
    pub fn accepts(&self, envelope: &BusEnvelope) -> bool {
        self.source.is_some() && envelope.worker == self.worker && envelope.generation == self.generation
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        if let Some(source) = self.source.take() {
            source.flow.store(FLOW_FLUSHING, Ordering::Release);
        }
    }
}

/// State moved onto a pipeline's streaming thread.
struct StreamThread {
    worker: WorkerId,
    generation: u64,
    bus: Bus,
    flow: Arc<AtomicU8>,
    parse: RawAudioParse,
    pitch: PitchShift,
    format: AudioFormat,
    source: SourceReceiver,
}

enum Flow {
    Continue,
    Flushing,
}

impl StreamThread {
    fn post(&self, message: BusMessage) {
        let envelope = BusEnvelope {
            worker: self.worker,
            generation: self.generation,
            message,
        };
        if self.bus.send(envelope).is_err() {
            debug!(worker = self.worker, "Bus closed; dropping pipeline message");
        }
    }

    fn post_error(&self, default_stage: &'static str, err: ProviderError) {
        let message = match err {
            ProviderError::PipelineStage { stage, message } => BusMessage::Error { stage, message },
            other => BusMessage::Error {
                stage: default_stage,
                message: other.to_string(),
            },
        };
        self.post(message);
    }

    /// Applies pause/resume requests to the sink.
    fn sync_flow(&self, sink: &mut dyn AudioSink, paused: &mut bool) -> Result<Flow> {
        match self.flow.load(Ordering::Acquire) {
            FLOW_FLUSHING => return Ok(Flow::Flushing),
            FLOW_PAUSED if !*paused => {
                sink.set_paused(true)?;
                *paused = true;
            }
            FLOW_PLAYING if *paused => {
                sink.set_paused(false)?;
                *paused = false;
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }

    fn run(mut self, target: SinkTarget) {
        let mut sink = match target.open(self.format) {
            Ok(sink) => sink,
            Err(e) => {
                warn!(worker = self.worker, "Failed to open sink: {}", e);
                self.post_error("sink", e);
                return;
            }
        };
        self.post(BusMessage::Started);

        let mut paused = false;
        loop {
            match self.sync_flow(sink.as_mut(), &mut paused) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Flushing) => return,
                Err(e) => return self.post_error("sink", e),
            }

            // The source keeps being drained while paused so the producer never blocks
            match self.source.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(bytes)) => {
                    let samples = AudioConvert::to_f32(&self.parse.push(&bytes));
                    let samples = self.pitch.process(&samples);
                    if let Err(e) = sink.write(&samples) {
                        return self.post_error("sink", e);
                    }
                }
                Ok(Err(e)) => return self.post_error("source", e),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        loop {
            match self.sync_flow(sink.as_mut(), &mut paused) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Flushing) => return,
                Err(e) => return self.post_error("sink", e),
            }
            if !paused && sink.is_drained() {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        if let Err(e) = sink.finish() {
            return self.post_error("sink", e);
        }
        self.post(BusMessage::Eos);
    }
}
