// SPDX-License-Identifier: MPL-2.0

//! Integration tests for the acquisition engine's streaming loop
//!
//! A scripted mock backend drives the loop through its failure-handling
//! paths: counter reset on success, the consecutive-failure ceiling,
//! incomplete-frame handling, stop/close idempotence, and serialized
//! reconfiguration.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use scancap::backends::{
    BackendKind, BackendProvider, BackendRegistry, CaptureBackend, DeviceDescriptor, Frame,
    PixelLayout,
};
use scancap::config::ParameterStore;
use scancap::engine::{AcquisitionEngine, ChannelSink, EngineConfig, EngineState, SinkEvent};
use scancap::errors::{CaptureError, CaptureResult, ParameterError, PullError};
use scancap::params::{ParamValue, ParameterRegistry};

/// One scripted pull outcome
#[derive(Clone, Copy)]
enum Pull {
    Frame,
    Timeout,
    Incomplete,
    Device,
}

#[derive(Default)]
struct MockLog {
    opens: u32,
    configures: u32,
    starts: u32,
    stops: u32,
    closes: u32,
    writes: Vec<(String, ParamValue)>,
}

#[derive(Clone, Copy, PartialEq)]
enum ReconfigureMode {
    Ok,
    RejectParameter,
    FailDevice,
}

struct MockBackend {
    script: VecDeque<Pull>,
    /// Outcome once the script is exhausted
    exhausted: Pull,
    log: Arc<Mutex<MockLog>>,
    reconfigure_mode: ReconfigureMode,
    fail_open: bool,
    streaming: bool,
    sequence: u64,
}

impl MockBackend {
    fn new(script: &[Pull], exhausted: Pull, log: Arc<Mutex<MockLog>>) -> Self {
        Self {
            script: script.iter().copied().collect(),
            exhausted,
            log,
            reconfigure_mode: ReconfigureMode::Ok,
            fail_open: false,
            streaming: false,
            sequence: 0,
        }
    }
}

impl CaptureBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Generic
    }

    fn open(&mut self, descriptor: &DeviceDescriptor) -> CaptureResult<()> {
        self.log.lock().unwrap().opens += 1;
        if self.fail_open {
            return Err(CaptureError::DeviceNotFound(descriptor.id.clone()));
        }
        Ok(())
    }

    fn configure(&mut self, _store: &mut ParameterStore) -> CaptureResult<()> {
        self.log.lock().unwrap().configures += 1;
        Ok(())
    }

    fn start_streaming(&mut self) -> CaptureResult<()> {
        self.log.lock().unwrap().starts += 1;
        self.streaming = true;
        Ok(())
    }

    fn pull_frame(&mut self, _timeout: Duration) -> Result<Frame, PullError> {
        // Keep the loop from spinning hot in tests
        std::thread::sleep(Duration::from_millis(1));
        let step = self.script.pop_front().unwrap_or(self.exhausted);
        match step {
            Pull::Frame => {
                let mut frame = Frame::new(2, 2, PixelLayout::Gray8, vec![0; 4]);
                frame.sequence = self.sequence;
                self.sequence += 1;
                Ok(frame)
            }
            Pull::Timeout => Err(PullError::Timeout),
            Pull::Incomplete => Err(PullError::Incomplete("truncated payload".into())),
            Pull::Device => Err(PullError::Device("transport dropped".into())),
        }
    }

    fn stop_streaming(&mut self) {
        if self.streaming {
            self.log.lock().unwrap().stops += 1;
            self.streaming = false;
        }
    }

    fn close(&mut self) {
        self.stop_streaming();
        self.log.lock().unwrap().closes += 1;
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn registry(&mut self) -> Option<&mut dyn ParameterRegistry> {
        None
    }

    fn write_parameter(
        &mut self,
        name: &str,
        value: ParamValue,
        store: &mut ParameterStore,
    ) -> CaptureResult<()> {
        match self.reconfigure_mode {
            ReconfigureMode::Ok => {
                self.log
                    .lock()
                    .unwrap()
                    .writes
                    .push((name.to_string(), value.clone()));
                store.set(name, value);
                Ok(())
            }
            ReconfigureMode::RejectParameter => {
                store.reset(name, ParamValue::Float(0.0));
                Err(ParameterError::NotWritable(name.to_string()).into())
            }
            ReconfigureMode::FailDevice => {
                // Could not resume acquisition after the write
                self.streaming = false;
                Err(CaptureError::Device("acquisition restart failed".into()))
            }
        }
    }
}

struct MockProvider {
    backends: Mutex<VecDeque<MockBackend>>,
}

impl MockProvider {
    fn single(backend: MockBackend) -> Box<Self> {
        Box::new(Self {
            backends: Mutex::new(VecDeque::from([backend])),
        })
    }

    fn queue(backends: Vec<MockBackend>) -> Box<Self> {
        Box::new(Self {
            backends: Mutex::new(backends.into()),
        })
    }
}

impl BackendProvider for MockProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Generic
    }

    fn discover(&self) -> Vec<DeviceDescriptor> {
        vec![descriptor()]
    }

    fn open(&self, _descriptor: &DeviceDescriptor) -> CaptureResult<Box<dyn CaptureBackend>> {
        self.backends
            .lock()
            .unwrap()
            .pop_front()
            .map(|b| Box::new(b) as Box<dyn CaptureBackend>)
            .ok_or_else(|| CaptureError::Device("no scripted backend left".into()))
    }
}

fn descriptor() -> DeviceDescriptor {
    DeviceDescriptor {
        kind: BackendKind::Generic,
        id: "mock-0".into(),
        label: "Mock device".into(),
    }
}

fn fast_config(ceiling: u32) -> EngineConfig {
    EngineConfig {
        pull_timeout: Duration::from_millis(5),
        failure_ceiling: ceiling,
        warmup: Duration::ZERO,
    }
}

fn engine_with(provider: Box<MockProvider>, config: EngineConfig) -> AcquisitionEngine {
    let mut registry = BackendRegistry::empty();
    registry.register(provider);
    AcquisitionEngine::new(registry, config, ParameterStore::in_memory())
}

/// Drain sink events until a terminal event or the deadline
fn collect_events(rx: &Receiver<SinkEvent>, deadline: Duration) -> (u64, Option<CaptureError>) {
    let start = Instant::now();
    let mut frames = 0;
    while start.elapsed() < deadline {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(SinkEvent::Frame(_)) => frames += 1,
            Ok(SinkEvent::Terminated(reason)) => return (frames, Some(reason)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    (frames, None)
}

const T: Pull = Pull::Timeout;
const F: Pull = Pull::Frame;

#[test]
fn test_ceiling_after_successes_tears_down_once() {
    // 5 good pulls, then timeouts forever: 5 frames delivered, one
    // terminal event, one teardown
    let log = Arc::new(Mutex::new(MockLog::default()));
    let backend = MockBackend::new(&[F, F, F, F, F], T, log.clone());
    let mut engine = engine_with(MockProvider::single(backend), fast_config(10));
    let (sink, rx) = ChannelSink::new();

    engine.select(&descriptor(), Box::new(sink)).unwrap();
    let (frames, terminal) = collect_events(&rx, Duration::from_secs(5));
    engine.wait_until_stopped();

    assert_eq!(frames, 5, "all scripted frames delivered");
    assert!(terminal.is_some(), "terminal event after the ceiling");
    assert_eq!(engine.state(), EngineState::Fatal);
    assert!(engine.last_error().is_some());

    let log = log.lock().unwrap();
    assert_eq!(log.opens, 1);
    assert_eq!(log.configures, 1);
    assert_eq!(log.stops, 1, "stop_streaming exactly once");
    assert_eq!(log.closes, 1, "close exactly once");
}

#[test]
fn test_success_resets_failure_counter() {
    // Two bursts of 9 timeouts, each broken by a success, never reach a
    // ceiling of 10; the final run of 10 does
    let mut script = Vec::new();
    script.extend([T; 9]);
    script.push(F);
    script.extend([T; 9]);
    script.push(F);
    let log = Arc::new(Mutex::new(MockLog::default()));
    let backend = MockBackend::new(&script, T, log);
    let mut engine = engine_with(MockProvider::single(backend), fast_config(10));
    let (sink, rx) = ChannelSink::new();

    engine.select(&descriptor(), Box::new(sink)).unwrap();
    let (frames, terminal) = collect_events(&rx, Duration::from_secs(5));
    engine.wait_until_stopped();

    assert_eq!(frames, 2, "both recovery frames delivered before the end");
    assert!(terminal.is_some());
    assert_eq!(engine.state(), EngineState::Fatal);
}

#[test]
fn test_incomplete_frames_not_counted_not_delivered() {
    // 10 incomplete frames against a ceiling of 3 change nothing; the one
    // good frame still arrives, then 3 device errors end the session
    let mut script = vec![Pull::Incomplete; 10];
    script.push(F);
    let log = Arc::new(Mutex::new(MockLog::default()));
    let backend = MockBackend::new(&script, Pull::Device, log);
    let mut engine = engine_with(MockProvider::single(backend), fast_config(3));
    let (sink, rx) = ChannelSink::new();

    engine.select(&descriptor(), Box::new(sink)).unwrap();
    let (frames, terminal) = collect_events(&rx, Duration::from_secs(5));
    engine.wait_until_stopped();

    assert_eq!(frames, 1, "incomplete frames are never delivered");
    assert!(terminal.is_some(), "device errors still reach the ceiling");
}

#[test]
fn test_warmup_window_suppresses_counting() {
    // Failures inside the warmup window never reach the ceiling
    let log = Arc::new(Mutex::new(MockLog::default()));
    let mut script = vec![T; 50];
    script.push(F);
    let backend = MockBackend::new(&script, F, log);
    let config = EngineConfig {
        pull_timeout: Duration::from_millis(5),
        failure_ceiling: 3,
        warmup: Duration::from_secs(30),
    };
    let mut engine = engine_with(MockProvider::single(backend), config);
    let (sink, rx) = ChannelSink::new();

    engine.select(&descriptor(), Box::new(sink)).unwrap();
    let (frames, terminal) = collect_events(&rx, Duration::from_millis(1500));

    assert!(frames >= 1, "stream survives the early failures");
    assert!(terminal.is_none(), "no teardown during warmup");

    engine.stop();
    engine.wait_until_stopped();
    assert_eq!(engine.state(), EngineState::Idle);
}

#[test]
fn test_stop_is_nonblocking_and_idempotent() {
    let log = Arc::new(Mutex::new(MockLog::default()));
    let backend = MockBackend::new(&[], F, log.clone());
    let mut engine = engine_with(MockProvider::single(backend), fast_config(10));
    let (sink, rx) = ChannelSink::new();

    engine.select(&descriptor(), Box::new(sink)).unwrap();
    assert_eq!(engine.state(), EngineState::Streaming);

    // Wait for at least one delivery so the loop is demonstrably running
    let (frames, _) = collect_events(&rx, Duration::from_millis(200));
    assert!(frames >= 1);

    engine.stop();
    engine.stop();
    engine.wait_until_stopped();

    assert_eq!(engine.state(), EngineState::Idle);
    let log = log.lock().unwrap();
    assert_eq!(log.stops, 1);
    assert_eq!(log.closes, 1);

    // A clean stop produces no terminal event
    let mut terminated = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, SinkEvent::Terminated(_)) {
            terminated = true;
        }
    }
    assert!(!terminated, "clean stop must not emit a terminal event");
}

#[test]
fn test_reconfigure_while_streaming_reaches_backend() {
    let log = Arc::new(Mutex::new(MockLog::default()));
    let backend = MockBackend::new(&[], F, log.clone());
    let mut engine = engine_with(MockProvider::single(backend), fast_config(10));
    let (sink, _rx) = ChannelSink::new();

    engine.select(&descriptor(), Box::new(sink)).unwrap();
    engine
        .reconfigure("camera/gain", ParamValue::Float(7.5))
        .unwrap();

    assert_eq!(engine.state(), EngineState::Streaming, "stream survives the write");
    {
        let log = log.lock().unwrap();
        assert_eq!(log.writes.len(), 1);
        assert_eq!(log.writes[0].0, "camera/gain");
    }

    engine.stop();
    engine.wait_until_stopped();
}

#[test]
fn test_reconfigure_rejection_keeps_streaming() {
    let log = Arc::new(Mutex::new(MockLog::default()));
    let mut backend = MockBackend::new(&[], F, log);
    backend.reconfigure_mode = ReconfigureMode::RejectParameter;
    let mut engine = engine_with(MockProvider::single(backend), fast_config(10));
    let (sink, _rx) = ChannelSink::new();

    engine.select(&descriptor(), Box::new(sink)).unwrap();
    let result = engine.reconfigure("camera/gain", ParamValue::Float(99.0));

    assert!(matches!(result, Err(CaptureError::Parameter(_))));
    assert_eq!(
        engine.state(),
        EngineState::Streaming,
        "parameter rejection never ends the session"
    );

    engine.stop();
    engine.wait_until_stopped();
}

#[test]
fn test_reconfigure_device_failure_goes_fatal() {
    let log = Arc::new(Mutex::new(MockLog::default()));
    let mut backend = MockBackend::new(&[], F, log.clone());
    backend.reconfigure_mode = ReconfigureMode::FailDevice;
    let mut engine = engine_with(MockProvider::single(backend), fast_config(10));
    let (sink, rx) = ChannelSink::new();

    engine.select(&descriptor(), Box::new(sink)).unwrap();
    let result = engine.reconfigure("camera/gain", ParamValue::Float(1.0));

    assert!(matches!(result, Err(CaptureError::Device(_))));
    let (_, terminal) = collect_events(&rx, Duration::from_secs(2));
    assert!(terminal.is_some(), "device-level reconfigure failure is terminal");

    engine.wait_until_stopped();
    assert_eq!(engine.state(), EngineState::Fatal);
    assert_eq!(log.lock().unwrap().closes, 1);
}

#[test]
fn test_select_while_streaming_is_rejected() {
    let log = Arc::new(Mutex::new(MockLog::default()));
    let backend = MockBackend::new(&[], F, log);
    let mut engine = engine_with(MockProvider::single(backend), fast_config(10));
    let (sink, _rx) = ChannelSink::new();

    engine.select(&descriptor(), Box::new(sink)).unwrap();

    let (second_sink, _rx2) = ChannelSink::new();
    let result = engine.select(&descriptor(), Box::new(second_sink));
    assert!(matches!(result, Err(CaptureError::State(_))));

    engine.stop();
    engine.wait_until_stopped();
}

#[test]
fn test_open_failure_lands_in_fatal() {
    let log = Arc::new(Mutex::new(MockLog::default()));
    let mut backend = MockBackend::new(&[], T, log.clone());
    backend.fail_open = true;
    let mut engine = engine_with(MockProvider::single(backend), fast_config(10));
    let (sink, _rx) = ChannelSink::new();

    let result = engine.select(&descriptor(), Box::new(sink));

    assert!(matches!(result, Err(CaptureError::DeviceNotFound(_))));
    assert_eq!(engine.state(), EngineState::Fatal);
    let log = log.lock().unwrap();
    assert_eq!(log.closes, 1, "failed open still closes the backend");
    assert_eq!(log.starts, 0);
}

#[test]
fn test_instant_fatal_teardown_always_reports_fatal() {
    // A session that dies on its very first pull races select's state
    // publication; the terminal state must never come back as Streaming
    for round in 0..300 {
        let log = Arc::new(Mutex::new(MockLog::default()));
        let backend = MockBackend::new(&[], Pull::Device, log);
        let mut engine = engine_with(MockProvider::single(backend), fast_config(1));
        let (sink, rx) = ChannelSink::new();

        engine.select(&descriptor(), Box::new(sink)).unwrap();
        let (_, terminal) = collect_events(&rx, Duration::from_secs(2));
        assert!(terminal.is_some(), "round {}: no terminal event", round);
        engine.wait_until_stopped();

        assert_eq!(
            engine.state(),
            EngineState::Fatal,
            "round {}: terminal state overwritten",
            round
        );
        assert!(engine.last_error().is_some());
    }
}

#[test]
fn test_select_after_fatal_starts_new_session() {
    let log = Arc::new(Mutex::new(MockLog::default()));
    // First backend dies immediately, second one streams
    let dead = MockBackend::new(&[], Pull::Device, log.clone());
    let alive = MockBackend::new(&[], F, log.clone());
    let mut engine = engine_with(MockProvider::queue(vec![dead, alive]), fast_config(2));

    let (sink, rx) = ChannelSink::new();
    engine.select(&descriptor(), Box::new(sink)).unwrap();
    let (_, terminal) = collect_events(&rx, Duration::from_secs(2));
    assert!(terminal.is_some());
    engine.wait_until_stopped();

    let (sink, rx) = ChannelSink::new();
    engine.select(&descriptor(), Box::new(sink)).unwrap();
    assert_eq!(engine.state(), EngineState::Streaming);
    let (frames, _) = collect_events(&rx, Duration::from_millis(200));
    assert!(frames >= 1, "fresh session streams after a fatal one");

    engine.stop();
    engine.wait_until_stopped();
    assert_eq!(log.lock().unwrap().closes, 2);
}
