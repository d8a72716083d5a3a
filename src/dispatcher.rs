//! Single control loop owning every worker, the pool and the request map.
//!
//! Client calls and pipeline bus messages are serialized through one task, so
//! pool and tracker updates never race with each other.

use crate::backends::{SpeechBackend, Voice};
use crate::error::{ProviderError, Result};
use crate::pipeline::sink::SinkTarget;
use crate::pipeline::{BusEnvelope, WorkerId};
use crate::pool::{RequestTracker, WorkerPool};
use crate::worker::{SpeechRequest, SynthWorker, SynthesisLock, WorkerEvent};
use std::sync::Arc;
use tokio::sync::mpsc::{channel, unbounded_channel, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task;
use tracing::{debug, info, warn};

const COMMAND_QUEUE: usize = 100;

/// Notifications for clients, keyed by task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderEvent {
    SpeechStart(u64),
    SpeechEnd(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub capacity: usize,
    pub idle: usize,
    pub in_flight: usize,
}

impl PoolStatus {
    pub fn is_busy(&self) -> bool {
        self.idle < self.capacity
    }
}

enum Command {
    Speak {
        request: SpeechRequest,
        sink: SinkTarget,
        reply: oneshot::Sender<Result<()>>,
    },
    Pause(u64),
    Resume(u64),
    Cancel(u64),
    Status(oneshot::Sender<PoolStatus>),
}

/// Cloneable handle to the control loop.
#[derive(Clone)]
pub struct Provider {
    tx: Sender<Command>,
    backend: Arc<dyn SpeechBackend>,
}

impl Provider {
    /// Spawns the control loop with `pool_size` workers sharing `lock`.
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        backend: Arc<dyn SpeechBackend>,
        pool_size: usize,
        lock: SynthesisLock,
    ) -> (Self, UnboundedReceiver<ProviderEvent>) {
        let (tx, rx) = channel(COMMAND_QUEUE);
        let (bus_tx, bus_rx) = unbounded_channel();
        let (events_tx, events_rx) = unbounded_channel();

        let workers = (0..pool_size)
            .map(|id| SynthWorker::new(id, backend.clone(), lock.clone(), bus_tx.clone()))
            .collect();
        let control = ControlLoop {
            workers,
            pool: WorkerPool::new(pool_size),
            tracker: RequestTracker::default(),
            events: events_tx,
        };
        task::spawn(control.run(rx, bus_rx));

        (Self { tx, backend }, events_rx)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ProviderError::ServiceStopped)
    }

    /// Starts speaking `request` into `sink`. Returns once audio is flowing
    /// or the request was refused.
    pub async fn speak(&self, request: SpeechRequest, sink: SinkTarget) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Speak {
            request,
            sink,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ProviderError::ServiceStopped)?
    }

    pub async fn pause(&self, request: u64) -> Result<()> {
        self.send(Command::Pause(request)).await
    }

    pub async fn resume(&self, request: u64) -> Result<()> {
        self.send(Command::Resume(request)).await
    }

    pub async fn cancel(&self, request: u64) -> Result<()> {
        self.send(Command::Cancel(request)).await
    }

    pub async fn status(&self) -> Result<PoolStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status(reply)).await?;
        rx.await.map_err(|_| ProviderError::ServiceStopped)
    }

    /// Whether any worker is leased. A stopped loop counts as idle.
    pub async fn is_busy(&self) -> bool {
        self.status().await.map(|s| s.is_busy()).unwrap_or(false)
    }

    /// Queries the backend's voice catalog off the async runtime.
    pub async fn voices(&self) -> Result<Vec<Voice>> {
        let backend = self.backend.clone();
        task::spawn_blocking(move || backend.list_voices())
            .await
            .map_err(|e| ProviderError::Io(std::io::Error::other(e)))?
    }

    pub fn backend(&self) -> &Arc<dyn SpeechBackend> {
        &self.backend
    }
}

struct ControlLoop {
    workers: Vec<SynthWorker>,
    pool: WorkerPool,
    tracker: RequestTracker,
    events: UnboundedSender<ProviderEvent>,
}

impl ControlLoop {
    async fn run(mut self, mut commands: Receiver<Command>, mut bus: UnboundedReceiver<BusEnvelope>) {
        info!(workers = self.workers.len(), "Control loop started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(envelope) = bus.recv() => self.handle_bus(envelope),
            }
        }

        for worker in &mut self.workers {
            worker.cancel();
        }
        info!("Control loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Speak {
                request,
                sink,
                reply,
            } => {
                let result = self.speak(request, sink);
                if reply.send(result).is_err() {
                    debug!("Speak caller went away before the reply");
                }
            }
            Command::Pause(request) => {
                if let Some(worker) = self.route(request) {
                    if self.workers[worker].pause() {
                        info!(request, worker, "Paused");
                    }
                }
            }
            Command::Resume(request) => {
                if let Some(worker) = self.route(request) {
                    if self.workers[worker].resume() {
                        info!(request, worker, "Resumed");
                    }
                }
            }
            Command::Cancel(request) => {
                if let Some(worker) = self.route(request) {
                    info!(request, worker, "Cancelling");
                    if let Some(WorkerEvent::Done(worker)) = self.workers[worker].cancel() {
                        self.complete(worker);
                    }
                }
            }
            Command::Status(reply) => {
                let _ = reply.send(PoolStatus {
                    capacity: self.pool.capacity(),
                    idle: self.pool.idle_count(),
                    in_flight: self.tracker.len(),
                });
            }
        }
    }

    fn route(&self, request: u64) -> Option<WorkerId> {
        let worker = self.tracker.route(request);
        if worker.is_none() {
            debug!(request, "No active utterance for request");
        }
        worker
    }

    fn speak(&mut self, request: SpeechRequest, sink: SinkTarget) -> Result<()> {
        if let Some(id) = request.id {
            if self.tracker.contains(id) {
                return Err(ProviderError::DuplicateRequest(id));
            }
        }

        let worker = self.pool.lease()?;
        if let Some(id) = request.id {
            self.tracker.bind(id, worker)?;
        }

        match self.workers[worker].speak(&request, sink) {
            Ok(()) => {
                info!(request = ?request.id, worker, voice = %request.voice_id, "Speaking");
                Ok(())
            }
            Err(e) => {
                warn!(request = ?request.id, worker, "Speak refused: {}", e);
                self.tracker.unbind_worker(worker);
                self.pool.release(worker);
                Err(e)
            }
        }
    }

    fn handle_bus(&mut self, envelope: BusEnvelope) {
        let Some(worker) = self.workers.get_mut(envelope.worker) else {
            warn!(worker = envelope.worker, "Bus message from unknown worker");
            return;
        };

        match worker.handle_bus(envelope) {
            Some(WorkerEvent::Start(worker)) => {
                if let Some(request) = self.tracker.request_for(worker) {
                    self.emit(ProviderEvent::SpeechStart(request));
                }
            }
            Some(WorkerEvent::Done(worker)) => self.complete(worker),
            None => {}
        }
    }

    /// Unbinds, releases, then announces the end of the utterance.
    fn complete(&mut self, worker: WorkerId) {
        let request = self.tracker.unbind_worker(worker);
        self.pool.release(worker);
        debug!(worker, request = ?request, "Worker released");
        if let Some(request) = request {
            self.emit(ProviderEvent::SpeechEnd(request));
        }
    }

    fn emit(&self, event: ProviderEvent) {
        if self.events.send(event).is_err() {
            debug!("No listener for {:?}", event);
        }
    }
}
