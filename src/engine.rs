// SPDX-License-Identifier: GPL-3.0-only

//! Acquisition engine
//!
//! Owns at most one open capture backend and runs the streaming loop on a
//! dedicated thread. The loop pulls frames with a bounded timeout, hands
//! them to the [`FrameSink`], and escalates consecutive pull failures:
//! once the ceiling is hit the session is torn down exactly once and the
//! engine lands in `Fatal` until the next `select`.
//!
//! State machine: `Idle` → `Opening` → `Streaming` → `Stopping` → `Idle`,
//! with `Fatal` reachable from `Opening` (startup failure) and `Streaming`
//! (failure ceiling, device-level reconfigure failure).
//!
//! `stop` is non-blocking: it raises a flag the loop observes at an
//! iteration boundary. Reconfiguration while streaming is serialized with
//! the loop through a command channel, never concurrent with a pull.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::backends::{BackendRegistry, CaptureBackend, DeviceDescriptor, Frame};
use crate::config::ParameterStore;
use crate::constants::{COMMAND_REPLY_TIMEOUT, FAILURE_CEILING, PULL_TIMEOUT, WARMUP_WINDOW};
use crate::errors::{CaptureError, CaptureResult, PullError};
use crate::params::ParamValue;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Opening,
    Streaming,
    Stopping,
    /// Terminal until the next `select`; `last_error` holds the reason
    Fatal,
}

/// Loop policy knobs with the documented defaults
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Bounded wait for a single pull
    pub pull_timeout: Duration,
    /// Consecutive failed pulls before fatal teardown
    pub failure_ceiling: u32,
    /// Settling window after streaming starts during which failed pulls do
    /// not count toward the ceiling
    pub warmup: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pull_timeout: PULL_TIMEOUT,
            failure_ceiling: FAILURE_CEILING,
            warmup: WARMUP_WINDOW,
        }
    }
}

/// Consumer of the streaming loop's output
///
/// Both callbacks run on the loop thread; frame ownership transfers on
/// delivery. `terminated` fires exactly once, only on fatal teardown.
pub trait FrameSink: Send {
    fn deliver(&mut self, frame: Frame);

    fn terminated(&mut self, _reason: &CaptureError) {}
}

/// Everything a [`ChannelSink`] emits
#[derive(Debug)]
pub enum SinkEvent {
    Frame(Frame),
    Terminated(CaptureError),
}

/// Stock sink delivering into an std mpsc channel
pub struct ChannelSink {
    tx: Sender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<SinkEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn deliver(&mut self, frame: Frame) {
        let _ = self.tx.send(SinkEvent::Frame(frame));
    }

    fn terminated(&mut self, reason: &CaptureError) {
        let _ = self.tx.send(SinkEvent::Terminated(reason.clone()));
    }
}

enum LoopCommand {
    Reconfigure {
        name: String,
        value: ParamValue,
        reply: Sender<CaptureResult<()>>,
    },
}

struct StateInner {
    state: EngineState,
    last_error: Option<CaptureError>,
}

struct Shared {
    state: Mutex<StateInner>,
    stop: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: EngineState, error: Option<CaptureError>) {
        let mut inner = self.state.lock().unwrap_or_else(|p| p.into_inner());
        inner.state = state;
        if error.is_some() {
            inner.last_error = error;
        }
    }
}

pub struct AcquisitionEngine {
    registry: BackendRegistry,
    config: EngineConfig,
    store: Arc<Mutex<ParameterStore>>,
    shared: Arc<Shared>,
    cmd_tx: Option<Sender<LoopCommand>>,
    loop_handle: Option<JoinHandle<()>>,
}

impl AcquisitionEngine {
    pub fn new(registry: BackendRegistry, config: EngineConfig, store: ParameterStore) -> Self {
        Self {
            registry,
            config,
            store: Arc::new(Mutex::new(store)),
            shared: Arc::new(Shared {
                state: Mutex::new(StateInner {
                    state: EngineState::Idle,
                    last_error: None,
                }),
                stop: AtomicBool::new(false),
            }),
            cmd_tx: None,
            loop_handle: None,
        }
    }

    pub fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.registry.list_devices()
    }

    pub fn state(&self) -> EngineState {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .state
    }

    pub fn last_error(&self) -> Option<CaptureError> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last_error
            .clone()
    }

    /// Open a device and start streaming into `sink`.
    ///
    /// Legal from `Idle` or `Fatal`. Runs the whole opening sequence
    /// (open → configure → start) synchronously; on success the backend
    /// moves onto the loop thread and the state is `Streaming`. Any
    /// opening failure closes the backend and lands in `Fatal` with the
    /// error returned.
    pub fn select(
        &mut self,
        descriptor: &DeviceDescriptor,
        sink: Box<dyn FrameSink>,
    ) -> CaptureResult<()> {
        self.reap_finished_loop();

        {
            let inner = self.shared.state.lock().unwrap_or_else(|p| p.into_inner());
            match inner.state {
                EngineState::Idle | EngineState::Fatal => {}
                other => {
                    return Err(CaptureError::State(format!(
                        "select is not legal while {:?}",
                        other
                    )));
                }
            }
        }
        if self.loop_handle.is_some() {
            return Err(CaptureError::State("previous session still running".into()));
        }

        info!(device = %descriptor.id, kind = %descriptor.kind, "opening capture session");
        self.shared.set_state(EngineState::Opening, None);

        let backend = match self.open_session(descriptor) {
            Ok(backend) => backend,
            Err(err) => {
                error!(device = %descriptor.id, error = %err, "opening failed");
                self.shared.set_state(EngineState::Fatal, Some(err.clone()));
                return Err(err);
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::channel();
        self.shared.stop.store(false, Ordering::SeqCst);

        let ctx = LoopContext {
            backend,
            sink,
            cmd_rx,
            shared: self.shared.clone(),
            store: self.store.clone(),
            config: self.config,
        };

        // Streaming must be published before the loop exists: the loop only
        // writes terminal states (Idle, Fatal), and a session that dies
        // immediately must not have its terminal state overwritten here
        self.shared.set_state(EngineState::Streaming, None);

        let handle = match thread::Builder::new()
            .name("acquisition-loop".into())
            .spawn(move || acquisition_loop(ctx))
        {
            Ok(handle) => handle,
            Err(e) => {
                let err = CaptureError::Device(format!("failed to spawn loop thread: {}", e));
                error!(error = %err, "opening failed");
                self.shared.set_state(EngineState::Fatal, Some(err.clone()));
                return Err(err);
            }
        };

        self.cmd_tx = Some(cmd_tx);
        self.loop_handle = Some(handle);
        Ok(())
    }

    fn open_session(&self, descriptor: &DeviceDescriptor) -> CaptureResult<Box<dyn CaptureBackend>> {
        let mut backend = self.registry.open(descriptor)?;

        if let Err(err) = backend.open(descriptor) {
            backend.close();
            return Err(err);
        }

        {
            let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(err) = backend.configure(&mut store) {
                backend.close();
                return Err(err);
            }
        }

        if let Err(err) = backend.start_streaming() {
            backend.close();
            return Err(err);
        }

        Ok(backend)
    }

    /// Request the loop to stop. Non-blocking; the loop observes the flag
    /// at its next iteration boundary and tears the session down. No-op
    /// when nothing is running.
    pub fn stop(&self) {
        let mut inner = self.shared.state.lock().unwrap_or_else(|p| p.into_inner());
        match inner.state {
            EngineState::Streaming | EngineState::Opening => {
                inner.state = EngineState::Stopping;
                drop(inner);
                self.shared.stop.store(true, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    /// Block until the loop thread has exited (the stopped signal)
    pub fn wait_until_stopped(&mut self) {
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.join();
        }
        self.cmd_tx = None;
    }

    /// Apply a single parameter.
    ///
    /// While `Streaming` the write is handed to the loop and applied
    /// between pulls. While `Idle` (or `Fatal`) it only updates the store
    /// and takes effect on the next `select`.
    pub fn reconfigure(&mut self, name: &str, value: ParamValue) -> CaptureResult<()> {
        self.reap_finished_loop();

        match self.state() {
            EngineState::Streaming => {
                let cmd_tx = self
                    .cmd_tx
                    .as_ref()
                    .ok_or_else(|| CaptureError::State("streaming loop not running".into()))?;
                let (reply_tx, reply_rx) = mpsc::channel();
                cmd_tx
                    .send(LoopCommand::Reconfigure {
                        name: name.to_string(),
                        value,
                        reply: reply_tx,
                    })
                    .map_err(|_| CaptureError::State("streaming loop has exited".into()))?;
                reply_rx
                    .recv_timeout(COMMAND_REPLY_TIMEOUT)
                    .map_err(|_| CaptureError::Device("no reply from streaming loop".into()))?
            }
            EngineState::Idle | EngineState::Fatal => {
                let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());
                store.set(name, value);
                Ok(())
            }
            other => Err(CaptureError::State(format!(
                "reconfigure is not legal while {:?}",
                other
            ))),
        }
    }

    /// Join a loop thread that ended on its own (fatal teardown or stop
    /// observed), so a new session can start
    fn reap_finished_loop(&mut self) {
        if let Some(handle) = &self.loop_handle
            && handle.is_finished()
        {
            self.wait_until_stopped();
        }
    }
}

impl Drop for AcquisitionEngine {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.wait_until_stopped();
    }
}

struct LoopContext {
    backend: Box<dyn CaptureBackend>,
    sink: Box<dyn FrameSink>,
    cmd_rx: Receiver<LoopCommand>,
    shared: Arc<Shared>,
    store: Arc<Mutex<ParameterStore>>,
    config: EngineConfig,
}

/// Streaming loop body. Owns the backend and the sink for the session.
fn acquisition_loop(mut ctx: LoopContext) {
    let started = Instant::now();
    let mut failures: u32 = 0;
    info!("streaming loop started");

    loop {
        // Stop flag is observed only at iteration boundaries
        if ctx.shared.stop.load(Ordering::SeqCst) {
            ctx.backend.stop_streaming();
            ctx.backend.close();
            ctx.shared.set_state(EngineState::Idle, None);
            info!("streaming loop stopped");
            return;
        }

        // Reconfiguration is serialized with pulls: commands drain here,
        // never while a pull is in flight
        while let Ok(command) = ctx.cmd_rx.try_recv() {
            let LoopCommand::Reconfigure { name, value, reply } = command;
            let result = {
                let mut store = ctx.store.lock().unwrap_or_else(|p| p.into_inner());
                ctx.backend.write_parameter(&name, value, &mut store)
            };

            // Parameter rejections leave the stream running; device-level
            // failures mean the backend could not resume and end the session
            let fatal_error = match &result {
                Err(err @ CaptureError::Device(_)) | Err(err @ CaptureError::DeviceBusy(_)) => {
                    Some(err.clone())
                }
                _ => None,
            };
            let _ = reply.send(result);

            if let Some(reason) = fatal_error {
                error!(param = %name, error = %reason, "reconfigure failed at device level");
                ctx.backend.close();
                ctx.shared.set_state(EngineState::Fatal, Some(reason.clone()));
                ctx.sink.terminated(&reason);
                return;
            }
        }

        match ctx.backend.pull_frame(ctx.config.pull_timeout) {
            Ok(frame) => {
                failures = 0;
                ctx.sink.deliver(frame);
            }
            Err(PullError::Incomplete(msg)) => {
                // Logged only: incomplete frames are neither counted
                // against the ceiling nor delivered
                debug!(reason = %msg, "discarding incomplete frame");
            }
            Err(err) => {
                if started.elapsed() < ctx.config.warmup {
                    debug!(error = %err, "pull failed during warmup window");
                    continue;
                }

                failures += 1;
                warn!(error = %err, consecutive = failures, "frame pull failed");

                if failures >= ctx.config.failure_ceiling {
                    let reason = CaptureError::from(err);
                    error!(
                        ceiling = ctx.config.failure_ceiling,
                        error = %reason,
                        "failure ceiling reached, tearing session down"
                    );
                    ctx.backend.stop_streaming();
                    ctx.backend.close();
                    ctx.shared.set_state(EngineState::Fatal, Some(reason.clone()));
                    ctx.sink.terminated(&reason);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.pull_timeout, Duration::from_millis(1000));
        assert_eq!(config.failure_ceiling, 10);
        assert_eq!(config.warmup, Duration::from_secs(10));
    }

    #[test]
    fn test_channel_sink_delivers() {
        let (mut sink, rx) = ChannelSink::new();
        sink.deliver(Frame::new(
            1,
            1,
            crate::backends::PixelLayout::Gray8,
            vec![0],
        ));
        sink.terminated(&CaptureError::Device("gone".into()));

        assert!(matches!(rx.recv().unwrap(), SinkEvent::Frame(_)));
        assert!(matches!(rx.recv().unwrap(), SinkEvent::Terminated(_)));
    }

    #[test]
    fn test_idle_engine_state() {
        let engine = AcquisitionEngine::new(
            BackendRegistry::empty(),
            EngineConfig::default(),
            ParameterStore::in_memory(),
        );
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.last_error().is_none());
    }

    #[test]
    fn test_stop_from_idle_is_noop() {
        let engine = AcquisitionEngine::new(
            BackendRegistry::empty(),
            EngineConfig::default(),
            ParameterStore::in_memory(),
        );
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_idle_reconfigure_updates_store() {
        let mut engine = AcquisitionEngine::new(
            BackendRegistry::empty(),
            EngineConfig::default(),
            ParameterStore::in_memory(),
        );
        engine
            .reconfigure("camera/gain", ParamValue::Float(3.0))
            .unwrap();
        let store = engine.store.lock().unwrap();
        assert_eq!(store.get_f64("camera/gain", 0.0), 3.0);
    }

    #[test]
    fn test_select_unknown_kind_goes_fatal() {
        let mut engine = AcquisitionEngine::new(
            BackendRegistry::empty(),
            EngineConfig::default(),
            ParameterStore::in_memory(),
        );
        let (sink, _rx) = ChannelSink::new();
        let descriptor = DeviceDescriptor {
            kind: crate::backends::BackendKind::Vision,
            id: "missing".into(),
            label: "missing".into(),
        };
        let result = engine.select(&descriptor, Box::new(sink));
        assert!(result.is_err());
        assert_eq!(engine.state(), EngineState::Fatal);
        assert!(engine.last_error().is_some());
    }
}
