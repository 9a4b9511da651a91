//! Demo Mode - Simulated meter for testing
//!
//! Emulates a meter in memory so the engine can be exercised without
//! hardware. Settings commands update the simulated device state and a data
//! request is answered with a full status frame. Voltage and current wander
//! a little around a 5 V / 1 A load.

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::protocol::commands::{
    MAX_BLANK_TIMEOUT_MINUTES, MAX_BRIGHTNESS, MAX_GROUP, MAX_RECORD_CURRENT,
};
use crate::protocol::frame::{RawGroup, GROUP_COUNT};
use crate::protocol::{DeviceModel, RawDataPoint, StreamTransport, FRAME_LENGTH};

/// Screen pages cycled by NEXT/PREV
const PAGE_COUNT: u16 = 6;

/// Simulated meter state machine
pub struct MeterSimulator {
    model: DeviceModel,
    state: RawDataPoint,
    /// Nominal load in volts and amps
    nominal_voltage: f64,
    nominal_current: f64,
    frames_sent: u64,
    rng: StdRng,
}

impl MeterSimulator {
    /// Create a simulator with a random seed
    pub fn new(model: DeviceModel) -> Self {
        Self::from_rng(model, StdRng::from_entropy())
    }

    /// Create a simulator with reproducible jitter
    pub fn with_seed(model: DeviceModel, seed: u64) -> Self {
        Self::from_rng(model, StdRng::seed_from_u64(seed))
    }

    fn from_rng(model: DeviceModel, rng: StdRng) -> Self {
        let state = RawDataPoint {
            device_model: model.code(),
            temperature_c: 25,
            temperature_f: 77,
            screen_brightness: 3,
            screen_timeout: 1,
            recording_threshold: 10,
            recording_enabled: 1,
            data_plus_voltage: 60,
            data_minus_voltage: 60,
            ..Default::default()
        };
        Self {
            model,
            state,
            nominal_voltage: 5.0,
            nominal_current: 1.0,
            frames_sent: 0,
            rng,
        }
    }

    /// Current device state as it would appear in the next frame
    pub fn state(&self) -> &RawDataPoint {
        &self.state
    }

    /// Change the simulated load
    pub fn set_load(&mut self, volts: f64, amps: f64) {
        self.nominal_voltage = volts.max(0.0);
        self.nominal_current = amps.max(0.0);
    }

    /// Apply one command byte. Returns the frame to send back, if the
    /// command asks for one.
    pub fn handle_command(&mut self, opcode: u8) -> Option<[u8; FRAME_LENGTH]> {
        let (base, arg) = (opcode & 0xF0, opcode & 0x0F);
        match opcode {
            0xA0..=0xAF if arg <= MAX_GROUP => self.state.screen_group = arg as u16,
            0xB0..=0xCF if opcode - 0xB0 <= MAX_RECORD_CURRENT => {
                self.state.recording_threshold = (opcode - 0xB0) as u16
            }
            0xD0..=0xDF if arg <= MAX_BRIGHTNESS => self.state.screen_brightness = arg as u16,
            0xE0..=0xEF if arg <= MAX_BLANK_TIMEOUT_MINUTES => self.state.screen_timeout = arg as u16,
            0xF0 => return Some(self.next_frame()),
            0xF1 => self.state.screen_page = (self.state.screen_page + 1) % PAGE_COUNT,
            0xF2 => {}
            0xF3 => {
                self.state.screen_page = (self.state.screen_page + PAGE_COUNT - 1) % PAGE_COUNT
            }
            0xF4 => {
                let group = (self.state.screen_group as usize).min(GROUP_COUNT - 1);
                self.state.groups[group] = RawGroup::default();
            }
            _ => debug!("simulator ignoring opcode {:#04x} (group {:#04x})", opcode, base),
        }
        None
    }

    /// Produce the next status frame and advance the simulated counters
    pub fn next_frame(&mut self) -> [u8; FRAME_LENGTH] {
        let volts = (self.nominal_voltage + self.rng.gen_range(-0.02..=0.02)).max(0.0);
        let amps = (self.nominal_current + self.rng.gen_range(-0.005..=0.005)).max(0.0);

        self.state.voltage = (volts * self.model.voltage_divisor()).round() as u16;
        self.state.current = (amps * self.model.current_divisor()).round() as u16;
        self.state.power = (volts * amps * 1000.0).round() as u32;
        self.state.resistance = if amps > 0.0 {
            (volts / amps * 10.0).round() as u32
        } else {
            0
        };

        // Pretend each frame covers one minute of load
        let charge_mah = (amps * 1000.0 / 60.0).round() as u32;
        let energy_mwh = (volts * amps * 1000.0 / 60.0).round() as u32;
        let group = (self.state.screen_group as usize).min(GROUP_COUNT - 1);
        let counters = &mut self.state.groups[group];
        counters.charge = counters.charge.saturating_add(charge_mah);
        counters.energy = counters.energy.saturating_add(energy_mwh);

        let threshold_amps = self.state.recording_threshold as f64 / 100.0;
        if self.state.recording_enabled != 0 && amps >= threshold_amps {
            self.state.recording_charge = self.state.recording_charge.saturating_add(charge_mah);
            self.state.recording_energy = self.state.recording_energy.saturating_add(energy_mwh);
            self.state.recording_runtime = self.state.recording_runtime.saturating_add(60);
        }

        self.frames_sent += 1;
        self.state.to_frame()
    }

    /// Number of frames produced so far
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }
}

/// Run `sim` behind an in-memory pipe and return the meter-facing transport.
///
/// Each response frame is written in pieces of at most `write_chunk` bytes so
/// the reader sees it split across several deliveries. The simulator stops
/// when the transport's writer is shut down or dropped.
pub fn spawn_simulated_meter(mut sim: MeterSimulator, write_chunk: usize) -> StreamTransport {
    let (local, mut device) = tokio::io::duplex(4096);
    let write_chunk = write_chunk.max(1);

    tokio::spawn(async move {
        let mut commands = [0u8; 64];
        loop {
            let n = match device.read(&mut commands).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &opcode in &commands[..n] {
                let Some(frame) = sim.handle_command(opcode) else {
                    continue;
                };
                for piece in frame.chunks(write_chunk) {
                    if device.write_all(piece).await.is_err() {
                        return;
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
        debug!("simulated meter stopped after {} frames", sim.frames_sent());
    });

    StreamTransport::new("simulator", local)
}
