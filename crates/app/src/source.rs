use std::{f32::consts::PI, time::Duration};

use toybox_core::{AudioSource, InputPort, MicrophoneState, Result};

/// Samples per processing quantum, as delivered by a browser audio worklet.
const QUANTUM: usize = 128;

/// Synthetic input that sweeps a sine tone, standing in for a microphone.
#[derive(Debug, Clone)]
pub struct SweepSource {
    permission: MicrophoneState,
    sample_rate: u32,
    start_hz: f32,
    end_hz: f32,
    sweep: Duration,
}

impl SweepSource {
    pub fn new(sample_rate: u32, permission: MicrophoneState) -> Self {
        Self {
            permission,
            sample_rate,
            start_hz: 110.0,
            end_hz: 3_520.0,
            sweep: Duration::from_secs(8),
        }
    }
}

impl AudioSource for SweepSource {
    fn permission(&self) -> MicrophoneState {
        self.permission
    }

    fn connect(&self, port: InputPort) -> Result<()> {
        let source = self.clone();
        std::thread::Builder::new()
            .name("toybox-sweep".to_string())
            .spawn(move || source.run(port))?;
        Ok(())
    }
}

impl SweepSource {
    fn run(&self, port: InputPort) {
        let rate = self.sample_rate.max(1) as f32;
        let quantum_period = Duration::from_secs_f32(QUANTUM as f32 / rate);
        let sweep_samples = (self.sweep.as_secs_f32() * rate).max(1.0);
        let mut phase = 0.0f32;
        let mut position = 0u64;

        loop {
            let mut quantum = Vec::with_capacity(QUANTUM);
            for _ in 0..QUANTUM {
                let progress = (position as f32 % sweep_samples) / sweep_samples;
                let frequency = self.start_hz * (self.end_hz / self.start_hz).powf(progress);
                phase = (phase + 2.0 * PI * frequency / rate) % (2.0 * PI);
                quantum.push(0.6 * phase.sin());
                position += 1;
            }
            if port.push(quantum).is_err() {
                tracing::debug!("analyser gone, stopping sweep source");
                return;
            }
            std::thread::sleep(quantum_period);
        }
    }
}
