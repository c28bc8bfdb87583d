//! Concurrent request lifecycle.
//!
//! [`AsyncEngine`] runs an [`LLMEngine`] on a single background task and
//! hands every caller an [`AsyncStream`] of incremental outputs.
//!
//! ```text
//!  generate() ──► RequestTracker ──events──► engine loop ──► LLMEngine::step
//!      ▲               │                         │
//!      └── AsyncStream ◄──── per-request chan ◄──┘
//! ```
//!
//! Submissions and cancellations travel to the loop over one channel and are
//! applied together at the start of each iteration. Outputs travel back over
//! one channel per request, so a request sees its outputs in the order the
//! engine produced them.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::executor::ModelExecutor;
use super::llm::{GenerationOutput, GenerationRequest, LLMEngine};
use crate::core::sequence::RequestId;
use crate::error::{Error, Result};

type OutputSender = UnboundedSender<Result<GenerationOutput>>;

/// Handle to one request's outputs.
///
/// Yields outputs until the terminal one, then ends. Dropping an unfinished
/// stream cancels its request.
#[derive(Debug)]
pub struct AsyncStream {
    request_id: RequestId,
    /// Registration this handle belongs to. An id can be reused once its
    /// request finishes, so cancellation goes by token.
    token: u64,
    receiver: UnboundedReceiver<Result<GenerationOutput>>,
    finished: bool,
    tracker: Arc<RequestTracker>,
}

impl AsyncStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the next output.
    ///
    /// Returns `None` once the terminal output or error has been consumed.
    pub async fn next_output(&mut self) -> Option<Result<GenerationOutput>> {
        let item = self.receiver.recv().await;
        self.observe(&item);
        item
    }

    /// Drain the stream and return the terminal output.
    pub async fn collect_final(mut self) -> Result<GenerationOutput> {
        let mut last = None;
        while let Some(item) = self.next_output().await {
            last = Some(item?);
        }
        last.ok_or_else(|| Error::EngineDead(format!("stream {} closed", self.request_id)))
    }

    /// Check if the terminal output or an error has been received.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn observe(&mut self, item: &Option<Result<GenerationOutput>>) {
        match item {
            Some(Ok(output)) if !output.finished() => {}
            _ => self.finished = true,
        }
    }
}

impl Stream for AsyncStream {
    type Item = Result<GenerationOutput>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = self.receiver.poll_recv(cx);
        if let Poll::Ready(item) = &poll {
            self.observe(item);
        }
        poll
    }
}

impl Drop for AsyncStream {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.cancel(&self.request_id, Some(self.token));
        }
    }
}

/// Message from callers to the engine loop.
#[derive(Debug)]
enum TrackerEvent {
    Add { request: GenerationRequest, token: u64 },
    Abort { request_id: RequestId, token: u64 },
}

#[derive(Debug)]
struct Registration {
    token: u64,
    sender: OutputSender,
}

#[derive(Debug, Default)]
struct TrackerState {
    streams: HashMap<RequestId, Registration>,
    next_token: u64,
    /// Set while the loop is not accepting requests.
    dead: Option<String>,
}

/// Maps request ids to their streams and queues work for the engine loop.
#[derive(Debug)]
pub struct RequestTracker {
    state: Mutex<TrackerState>,
    events: UnboundedSender<TrackerEvent>,
}

impl RequestTracker {
    fn new(events: UnboundedSender<TrackerEvent>) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                dead: Some("background loop has not been started".to_string()),
                ..Default::default()
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request and queue it for admission.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineDead`] while the loop is not running, or
    /// [`Error::DuplicateRequest`] if the id has an open stream.
    pub fn add_request(
        self: &Arc<Self>,
        request: GenerationRequest,
    ) -> Result<AsyncStream> {
        let mut state = self.lock();
        if let Some(reason) = &state.dead {
            return Err(Error::EngineDead(reason.clone()));
        }
        if state.streams.contains_key(&request.request_id) {
            return Err(Error::DuplicateRequest(request.request_id));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let request_id = request.request_id.clone();
        let token = state.next_token;
        state.next_token += 1;
        state
            .streams
            .insert(request_id.clone(), Registration { token, sender });
        // The receiver lives as long as the tracker
        let _ = self.events.send(TrackerEvent::Add { request, token });

        Ok(AsyncStream {
            request_id,
            token,
            receiver,
            finished: false,
            tracker: Arc::clone(self),
        })
    }

    /// Cancel a request. Unknown and finished ids are ignored.
    ///
    /// An open stream receives a terminal aborted output right away; the
    /// engine releases the request at its next iteration.
    pub fn abort_request(&self, request_id: &str) {
        self.cancel(request_id, None);
    }

    /// Cancel the registration of `request_id`, or only the one holding
    /// `token` when given.
    ///
    /// The loop hears about it unless it is dead; a restart cancels whatever
    /// the previous loop left behind.
    fn cancel(&self, request_id: &str, token: Option<u64>) {
        let mut state = self.lock();
        let Some(registration) = state.streams.get(request_id) else {
            return;
        };
        if token.is_some_and(|token| token != registration.token) {
            return;
        }
        let Some(registration) = state.streams.remove(request_id) else {
            return;
        };

        info!(request_id, "aborted request");
        let _ = registration
            .sender
            .send(Ok(GenerationOutput::aborted(request_id)));
        // Sent under the lock so it reaches the loop before any resubmission
        if state.dead.is_none() {
            let _ = self.events.send(TrackerEvent::Abort {
                request_id: request_id.to_string(),
                token: registration.token,
            });
        }
    }

    /// Deliver an engine output to its stream.
    ///
    /// Outputs for closed streams are dropped.
    pub fn process_request_output(&self, output: GenerationOutput) {
        let mut state = self.lock();
        let sender = if output.finished() {
            state.streams.remove(&output.request_id).map(|r| r.sender)
        } else {
            state
                .streams
                .get(&output.request_id)
                .map(|r| r.sender.clone())
        };
        drop(state);

        if let Some(sender) = sender {
            let _ = sender.send(Ok(output));
        }
    }

    /// Deliver a per-request error and close the stream.
    pub fn fail_request(&self, request_id: &str, err: Error) {
        let registration = self.lock().streams.remove(request_id);
        if let Some(registration) = registration {
            let _ = registration.sender.send(Err(err));
        }
    }

    /// Mark the loop dead and send the reason to every open stream once.
    pub fn propagate_error(&self, reason: &str) {
        let streams = {
            let mut state = self.lock();
            state.dead = Some(reason.to_string());
            std::mem::take(&mut state.streams)
        };
        for registration in streams.into_values() {
            let _ = registration
                .sender
                .send(Err(Error::EngineDead(reason.to_string())));
        }
    }

    /// Stop accepting requests and finish every open stream as aborted.
    pub fn abort_all(&self, reason: &str) {
        let streams = {
            let mut state = self.lock();
            state.dead = Some(reason.to_string());
            std::mem::take(&mut state.streams)
        };
        for (request_id, registration) in streams {
            let _ = registration
                .sender
                .send(Ok(GenerationOutput::aborted(request_id)));
        }
    }

    /// Number of open streams.
    pub fn num_open_streams(&self) -> usize {
        self.lock().streams.len()
    }

    fn is_dead(&self) -> bool {
        self.lock().dead.is_some()
    }

    fn revive(&self) {
        self.lock().dead = None;
    }
}

/// Apply queued events in order.
///
/// Returns the requests to admit and the ids to cancel. A request cancelled
/// before the drain is dropped from the admissions; a later registration of
/// the same id is kept.
fn drain_events(
    first: Option<TrackerEvent>,
    events: &mut UnboundedReceiver<TrackerEvent>,
) -> (Vec<GenerationRequest>, Vec<RequestId>) {
    let mut new_requests: Vec<(u64, GenerationRequest)> = Vec::new();
    let mut aborted = Vec::new();

    let mut next = first;
    loop {
        match next {
            Some(TrackerEvent::Add { request, token }) => new_requests.push((token, request)),
            Some(TrackerEvent::Abort { request_id, token }) => {
                let before = new_requests.len();
                new_requests.retain(|(t, _)| *t != token);
                // Never admitted, so there is nothing to cancel in the engine
                if new_requests.len() == before {
                    aborted.push(request_id);
                }
            }
            None => {}
        }
        match events.try_recv() {
            Ok(event) => next = Some(event),
            Err(_) => break,
        }
    }
    let new_requests = new_requests.into_iter().map(|(_, r)| r).collect();
    (new_requests, aborted)
}

#[derive(Debug, Default)]
struct LoopState {
    /// Supervisor of the running loop.
    background: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    started: bool,
}

/// Async front end that drives an [`LLMEngine`] on a background task.
pub struct AsyncEngine<E> {
    engine: Arc<tokio::sync::Mutex<LLMEngine<E>>>,
    tracker: Arc<RequestTracker>,
    events: Arc<tokio::sync::Mutex<UnboundedReceiver<TrackerEvent>>>,
    state: Mutex<LoopState>,
    start_engine_loop: bool,
}

impl<E: ModelExecutor + 'static> AsyncEngine<E> {
    pub fn new(engine: LLMEngine<E>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            start_engine_loop: engine.config().start_engine_loop,
            engine: Arc::new(tokio::sync::Mutex::new(engine)),
            tracker: Arc::new(RequestTracker::new(sender)),
            events: Arc::new(tokio::sync::Mutex::new(receiver)),
            state: Mutex::new(LoopState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the background loop.
    ///
    /// Also restarts a loop that died or was shut down. Requests left in the
    /// scheduler by the previous loop are cancelled on restart.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoopAlreadyRunning`] if the loop is alive.
    pub fn start_background_loop(&self) -> Result<()> {
        let mut state = self.lock_state();
        // A dead tracker means the loop has returned, even if its
        // supervisor is still finishing up
        let alive = state
            .background
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if alive && !self.tracker.is_dead() {
            return Err(Error::LoopAlreadyRunning);
        }

        // Events sent to the previous loop belong to closed streams
        {
            let Ok(mut events) = self.events.try_lock() else {
                return Err(Error::LoopAlreadyRunning);
            };
            while events.try_recv().is_ok() {}
        }

        let shutdown = CancellationToken::new();
        let engine_loop = tokio::spawn(run_engine_loop(
            Arc::clone(&self.engine),
            Arc::clone(&self.tracker),
            Arc::clone(&self.events),
            shutdown.clone(),
        ));
        let tracker = Arc::clone(&self.tracker);
        let supervisor = tokio::spawn(async move {
            match engine_loop.await {
                Ok(Ok(())) => {
                    info!("engine loop stopped");
                    tracker.abort_all("engine loop was shut down");
                }
                Ok(Err(err)) => {
                    error!(error = %err, "engine loop died");
                    tracker.propagate_error(&err.to_string());
                }
                Err(join_err) => {
                    let reason = if join_err.is_panic() {
                        "engine loop panicked"
                    } else {
                        "engine loop was cancelled"
                    };
                    error!(reason, "engine loop died");
                    tracker.propagate_error(reason);
                }
            }
        });

        self.tracker.revive();
        state.background = Some(supervisor);
        state.shutdown = shutdown;
        state.started = true;
        Ok(())
    }

    /// Submit a request and return its output stream.
    ///
    /// Starts the loop on first use when `start_engine_loop` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineDead`] if the loop is not running, or
    /// [`Error::DuplicateRequest`] if the id is already in flight.
    pub fn generate(&self, request: GenerationRequest) -> Result<AsyncStream> {
        if self.start_engine_loop && !self.lock_state().started {
            self.start_background_loop()?;
        }
        self.tracker.add_request(request)
    }

    /// Cancel a request. Never fails.
    pub fn abort(&self, request_id: &str) {
        self.tracker.abort_request(request_id);
    }

    /// Check if the background loop is accepting requests.
    pub fn is_running(&self) -> bool {
        let running = self
            .lock_state()
            .background
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        running && !self.tracker.is_dead()
    }

    /// Check if the loop was started and then stopped or died.
    pub fn is_dead(&self) -> bool {
        let started = self.lock_state().started;
        started && !self.is_running()
    }

    /// Stop the loop after its current iteration.
    ///
    /// Open streams finish as aborted. The loop can be started again.
    pub async fn shutdown(&self) {
        let handle = {
            let mut state = self.lock_state();
            state.shutdown.cancel();
            state.background.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    /// Shared handle to the wrapped engine.
    pub fn engine(&self) -> &Arc<tokio::sync::Mutex<LLMEngine<E>>> {
        &self.engine
    }
}

impl<E> Drop for AsyncEngine<E> {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown
            .cancel();
    }
}

async fn run_engine_loop<E: ModelExecutor>(
    engine: Arc<tokio::sync::Mutex<LLMEngine<E>>>,
    tracker: Arc<RequestTracker>,
    events: Arc<tokio::sync::Mutex<UnboundedReceiver<TrackerEvent>>>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut events = events.lock().await;
    {
        let mut engine = engine.lock().await;
        let leftover = engine.scheduler().request_ids();
        if !leftover.is_empty() {
            debug!(count = leftover.len(), "cancelling requests left by previous loop");
            engine.abort_request(leftover)?;
        }
    }

    loop {
        let has_work = engine.lock().await.has_unfinished_requests();
        let first = if has_work {
            None
        } else {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(event) => Some(event),
                    None => return Ok(()),
                },
            }
        };
        if shutdown.is_cancelled() {
            return Ok(());
        }

        let (new_requests, aborted) = drain_events(first, &mut events);

        let mut guard = engine.lock().await;
        if !aborted.is_empty() {
            guard.abort_request(&aborted)?;
        }
        for request in new_requests {
            let request_id = request.request_id.clone();
            if let Err(err) = guard.add_request(request) {
                debug!(request_id = %request_id, error = %err, "rejected request");
                tracker.fail_request(&request_id, err);
            }
        }
        let outputs = guard.step().await?;
        drop(guard);

        for output in outputs {
            tracker.process_request_output(output);
        }
        tokio::task::yield_now().await;
    }
}
