use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::{
    analysis::{validate_fft_size, AnalysisFrame, FrameRecycler, SpectralAnalyser},
    config::AnalysisConfig,
    Result, ToyboxError,
};

/// Permission state of the microphone, as reported by the audio backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MicrophoneState {
    Granted,
    /// The user has not answered the permission request yet.
    Prompt,
    Denied,
    /// No input device exists on this host.
    Unavailable,
}

/// Live audio input, typically a microphone.
pub trait AudioSource: Send + Sync {
    fn permission(&self) -> MicrophoneState;

    /// Starts delivering mono sample quanta into `port`.
    fn connect(&self, port: InputPort) -> Result<()>;
}

/// Capability handed to toys that want to react to audio.
#[derive(Clone)]
pub struct AudioCapability {
    source: Arc<dyn AudioSource>,
    config: AnalysisConfig,
}

impl AudioCapability {
    pub fn new(source: Arc<dyn AudioSource>, config: AnalysisConfig) -> Self {
        Self { source, config }
    }

    pub fn permission(&self) -> MicrophoneState {
        self.source.permission()
    }

    /// Spawns an analyser and connects the audio source to it.
    pub fn attach(&self) -> Result<AnalyserNode> {
        match self.source.permission() {
            MicrophoneState::Granted => {}
            state => return Err(ToyboxError::AudioUnavailable(state)),
        }
        let node = AnalyserNode::spawn(&self.config)?;
        self.source.connect(node.input_port())?;
        Ok(node)
    }
}

impl std::fmt::Debug for AudioCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCapability")
            .field("config", &self.config)
            .finish()
    }
}

/// Producer side of an analyser's input queue.
#[derive(Debug, Clone)]
pub struct InputPort {
    tx: Sender<Vec<f32>>,
}

impl InputPort {
    /// Queues one quantum without blocking. `Ok(false)` means the quantum was
    /// dropped because the queue is full; an error means the analyser stopped.
    pub fn push(&self, quantum: Vec<f32>) -> Result<bool> {
        match self.tx.try_send(quantum) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                tracing::trace!("analyser input full, dropping quantum");
                Ok(false)
            }
            Err(TrySendError::Disconnected(_)) => Err(ToyboxError::Disconnected("analyser input")),
        }
    }
}

/// A [`SpectralAnalyser`] running on its own thread.
///
/// Input quanta and output frames travel over bounded channels; the worker
/// never waits on the consumer and drops frames the consumer has no room for.
#[derive(Debug)]
pub struct AnalyserNode {
    input: Sender<Vec<f32>>,
    stop: Option<Sender<()>>,
    frames: Receiver<AnalysisFrame>,
    recycler: FrameRecycler,
    dropped: Arc<AtomicU64>,
    bin_count: usize,
    worker: Option<JoinHandle<()>>,
}

impl AnalyserNode {
    pub fn spawn(config: &AnalysisConfig) -> Result<Self> {
        validate_fft_size(config.fft_size)?;
        let mut analyser = SpectralAnalyser::new(config.fft_size)?;
        let recycler = analyser.recycler();
        let bin_count = analyser.bin_count();

        let (input_tx, input_rx) = crossbeam_channel::bounded::<Vec<f32>>(config.input_capacity);
        let (frame_tx, frame_rx) = crossbeam_channel::bounded(config.frame_capacity);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let dropped = Arc::new(AtomicU64::new(0));

        let worker_dropped = dropped.clone();
        let worker_recycler = recycler.clone();
        let worker = std::thread::Builder::new()
            .name("toybox-analyser".to_string())
            .spawn(move || {
                tracing::debug!(fft_size = analyser.fft_size(), "analyser thread started");
                loop {
                    crossbeam_channel::select! {
                        recv(input_rx) -> quantum => {
                            let Ok(quantum) = quantum else { break };
                            analyser.process(&quantum, |frame| match frame_tx.try_send(frame) {
                                Ok(()) => {}
                                Err(TrySendError::Full(frame))
                                | Err(TrySendError::Disconnected(frame)) => {
                                    worker_dropped.fetch_add(1, Ordering::Relaxed);
                                    worker_recycler.recycle(frame);
                                }
                            });
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                tracing::debug!(
                    frames = analyser.frames_emitted(),
                    "analyser thread stopped"
                );
            })?;

        Ok(Self {
            input: input_tx,
            stop: Some(stop_tx),
            frames: frame_rx,
            recycler,
            dropped,
            bin_count,
            worker: Some(worker),
        })
    }

    pub fn bin_count(&self) -> usize {
        self.bin_count
    }

    /// Returns a new producer handle. Pushes fail once the node has shut down.
    pub fn input_port(&self) -> InputPort {
        InputPort {
            tx: self.input.clone(),
        }
    }

    pub fn recycler(&self) -> FrameRecycler {
        self.recycler.clone()
    }

    /// Number of frames dropped because the consumer fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn try_frame(&self) -> Option<AnalysisFrame> {
        self.frames.try_recv().ok()
    }

    /// Waits up to `timeout` for the next frame. `Ok(None)` means the wait
    /// timed out.
    pub fn recv_frame_timeout(&self, timeout: Duration) -> Result<Option<AnalysisFrame>> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ToyboxError::Disconnected("analysis frame")),
        }
    }

    /// Stops the worker thread and waits for it. Quanta still queued are
    /// discarded.
    pub fn shutdown(&mut self) {
        self.stop.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("analyser thread panicked");
            }
        }
    }
}

impl Drop for AnalyserNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn config(fft_size: usize) -> AnalysisConfig {
        AnalysisConfig {
            fft_size,
            ..Default::default()
        }
    }

    #[test]
    fn invalid_size_fails_before_spawning() {
        let err = AnalyserNode::spawn(&config(100)).unwrap_err();
        assert!(matches!(err, ToyboxError::InvalidFftSize { size: 100 }));
    }

    #[test]
    fn frames_arrive_from_the_worker_thread() {
        let node = AnalyserNode::spawn(&config(64)).unwrap();
        let port = node.input_port();

        assert!(port.push(vec![0.5; 32]).unwrap());
        assert!(port.push(Vec::new()).unwrap());
        assert!(port.push(vec![0.5; 96]).unwrap());

        let timeout = Duration::from_secs(5);
        let first = node.recv_frame_timeout(timeout).unwrap().expect("first frame");
        let second = node.recv_frame_timeout(timeout).unwrap().expect("second frame");

        assert_eq!(first.index, 0);
        assert_eq!(second.index, 1);
        assert_eq!(first.frequency_data.len(), node.bin_count());
        assert!((first.rms - 0.5).abs() < 1e-6);
        assert!(node.try_frame().is_none());
    }

    #[test]
    fn shutdown_closes_the_input() {
        let mut node = AnalyserNode::spawn(&config(32)).unwrap();
        let port = node.input_port();
        node.shutdown();
        let err = port.push(vec![0.0; 32]).unwrap_err();
        assert!(matches!(err, ToyboxError::Disconnected(_)));
    }

    struct FakeSource {
        state: MicrophoneState,
        ports: Mutex<Vec<InputPort>>,
    }

    impl AudioSource for FakeSource {
        fn permission(&self) -> MicrophoneState {
            self.state
        }

        fn connect(&self, port: InputPort) -> Result<()> {
            self.ports.lock().unwrap().push(port);
            Ok(())
        }
    }

    #[test]
    fn capability_reports_missing_permission_distinctly() {
        for state in [
            MicrophoneState::Denied,
            MicrophoneState::Prompt,
            MicrophoneState::Unavailable,
        ] {
            let source = Arc::new(FakeSource {
                state,
                ports: Mutex::new(Vec::new()),
            });
            let capability = AudioCapability::new(source.clone(), config(64));

            let err = capability.attach().unwrap_err();
            assert!(matches!(err, ToyboxError::AudioUnavailable(s) if s == state));
            assert!(source.ports.lock().unwrap().is_empty());
        }
    }

    #[test]
    fn capability_connects_granted_source() {
        let source = Arc::new(FakeSource {
            state: MicrophoneState::Granted,
            ports: Mutex::new(Vec::new()),
        });
        let capability = AudioCapability::new(source.clone(), config(64));
        let node = capability.attach().unwrap();

        let port = source.ports.lock().unwrap().pop().expect("source connected");
        assert!(port.push(vec![0.0; 64]).unwrap());

        let frame = node
            .recv_frame_timeout(Duration::from_secs(5))
            .unwrap()
            .expect("silent frame");
        assert_eq!(frame.rms, 0.0);
    }
}
