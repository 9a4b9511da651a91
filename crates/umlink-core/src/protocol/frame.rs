//! Status frame decoding
//!
//! The meter answers a data request with a fixed 130-byte frame of
//! big-endian integers:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 2 | device model code |
//! | 2 | 2 | voltage |
//! | 4 | 2 | current |
//! | 6 | 4 | power (mW) |
//! | 10 | 2 | temperature (°C) |
//! | 12 | 2 | temperature (°F) |
//! | 14 | 2 | selected group |
//! | 16 + 8i | 4 + 4 | group i charge (mAh), energy (mWh) |
//! | 96 | 2 | D+ voltage (10 mV) |
//! | 98 | 2 | D- voltage (10 mV) |
//! | 100 | 2 | charge mode |
//! | 102 | 4 | recording charge (mAh) |
//! | 106 | 4 | recording energy (mWh) |
//! | 110 | 2 | recording current threshold (10 mA) |
//! | 112 | 4 | recording runtime (s) |
//! | 116 | 2 | recording enabled |
//! | 118 | 2 | screen blank timeout (min) |
//! | 120 | 2 | screen brightness |
//! | 122 | 4 | load resistance (0.1 Ω) |
//! | 126 | 2 | screen page |
//!
//! Voltage and current resolution depends on the device model.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ProtocolError, FRAME_LENGTH};

/// Number of charge/energy groups in a frame
pub const GROUP_COUNT: usize = 10;

const GROUPS_OFFSET: usize = 16;
const GROUP_STRIDE: usize = 8;

/// Milli-unit-hours to unit-seconds (mAh to C, mWh to J)
const MILLI_HOURS_TO_SECONDS: f64 = 1000.0 * 3600.0;

/// Meter variant that produced a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceModel {
    /// Unrecognized code
    Unknown,
    /// UM24C
    Um24c,
    /// UM25C, with 1 mV / 0.1 mA resolution
    Um25c,
    /// UM34C
    Um34c,
}

impl DeviceModel {
    /// Map the model code at frame offset 0
    pub fn from_code(code: u16) -> Self {
        match code {
            2403 => DeviceModel::Um24c,
            2505 => DeviceModel::Um25c,
            3404 => DeviceModel::Um34c,
            _ => DeviceModel::Unknown,
        }
    }

    /// Model code as sent on the wire
    pub fn code(&self) -> u16 {
        match self {
            DeviceModel::Unknown => 0,
            DeviceModel::Um24c => 2403,
            DeviceModel::Um25c => 2505,
            DeviceModel::Um34c => 3404,
        }
    }

    /// Raw voltage units per volt
    pub fn voltage_divisor(&self) -> f64 {
        match self {
            DeviceModel::Um25c => 1000.0,
            _ => 100.0,
        }
    }

    /// Raw current units per amp
    pub fn current_divisor(&self) -> f64 {
        match self {
            DeviceModel::Um25c => 10000.0,
            _ => 1000.0,
        }
    }
}

/// Fast-charge protocol detected on the data lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChargeMode {
    /// Unrecognized code
    Unknown,
    /// Quick Charge 2.0
    Qc2_0,
    /// Quick Charge 3.0
    Qc3_0,
    /// Apple 2.4 A
    App2_4A,
    /// Apple 2.1 A
    App2_1A,
    /// Apple 1.0 A
    App1_0A,
    /// Apple 0.5 A
    App0_5A,
    /// Dedicated charging port, 1.5 A
    Dcp1_5A,
    /// Samsung
    Samsung,
}

impl ChargeMode {
    /// Map the charge mode code at frame offset 100
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => ChargeMode::Qc2_0,
            2 => ChargeMode::Qc3_0,
            3 => ChargeMode::App2_4A,
            4 => ChargeMode::App2_1A,
            5 => ChargeMode::App1_0A,
            6 => ChargeMode::App0_5A,
            7 => ChargeMode::Dcp1_5A,
            8 => ChargeMode::Samsung,
            _ => ChargeMode::Unknown,
        }
    }

    /// Code as sent on the wire
    pub fn code(&self) -> u16 {
        match self {
            ChargeMode::Unknown => 0,
            ChargeMode::Qc2_0 => 1,
            ChargeMode::Qc3_0 => 2,
            ChargeMode::App2_4A => 3,
            ChargeMode::App2_1A => 4,
            ChargeMode::App1_0A => 5,
            ChargeMode::App0_5A => 6,
            ChargeMode::Dcp1_5A => 7,
            ChargeMode::Samsung => 8,
        }
    }
}

/// Raw group counters (mAh, mWh)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawGroup {
    /// mAh
    pub charge: u32,
    /// mWh
    pub energy: u32,
}

/// Device-unit integers exactly as they appear in the frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDataPoint {
    /// Model code
    pub device_model: u16,
    /// Model-dependent units
    pub voltage: u16,
    /// Model-dependent units
    pub current: u16,
    /// mW
    pub power: u32,
    /// Degrees Celsius
    pub temperature_c: u16,
    /// Degrees Fahrenheit
    pub temperature_f: u16,
    /// Selected group in the low byte
    pub screen_group: u16,
    /// Per-group counters
    pub groups: [RawGroup; GROUP_COUNT],
    /// 10 mV
    pub data_plus_voltage: u16,
    /// 10 mV
    pub data_minus_voltage: u16,
    /// Charge mode code
    pub charge_mode: u16,
    /// mAh
    pub recording_charge: u32,
    /// mWh
    pub recording_energy: u32,
    /// 10 mA
    pub recording_threshold: u16,
    /// seconds
    pub recording_runtime: u32,
    /// Non-zero while recording
    pub recording_enabled: u16,
    /// minutes
    pub screen_timeout: u16,
    /// 0..=5
    pub screen_brightness: u16,
    /// 0.1 Ω
    pub resistance: u32,
    /// Page shown on the display
    pub screen_page: u16,
}

impl RawDataPoint {
    /// Extract the raw fields from a frame. `data` must hold a full frame.
    fn read(data: &[u8]) -> Self {
        let u16_at = |offset: usize| BigEndian::read_u16(&data[offset..offset + 2]);
        let u32_at = |offset: usize| BigEndian::read_u32(&data[offset..offset + 4]);

        let mut groups = [RawGroup::default(); GROUP_COUNT];
        for (i, group) in groups.iter_mut().enumerate() {
            let base = GROUPS_OFFSET + GROUP_STRIDE * i;
            group.charge = u32_at(base);
            group.energy = u32_at(base + 4);
        }

        Self {
            device_model: u16_at(0),
            voltage: u16_at(2),
            current: u16_at(4),
            power: u32_at(6),
            temperature_c: u16_at(10),
            temperature_f: u16_at(12),
            screen_group: u16_at(14),
            groups,
            data_plus_voltage: u16_at(96),
            data_minus_voltage: u16_at(98),
            charge_mode: u16_at(100),
            recording_charge: u32_at(102),
            recording_energy: u32_at(106),
            recording_threshold: u16_at(110),
            recording_runtime: u32_at(112),
            recording_enabled: u16_at(116),
            screen_timeout: u16_at(118),
            screen_brightness: u16_at(120),
            resistance: u32_at(122),
            screen_page: u16_at(126),
        }
    }

    /// Lay the fields out as a wire frame
    pub fn to_frame(&self) -> [u8; FRAME_LENGTH] {
        let mut frame = [0u8; FRAME_LENGTH];
        BigEndian::write_u16(&mut frame[0..2], self.device_model);
        BigEndian::write_u16(&mut frame[2..4], self.voltage);
        BigEndian::write_u16(&mut frame[4..6], self.current);
        BigEndian::write_u32(&mut frame[6..10], self.power);
        BigEndian::write_u16(&mut frame[10..12], self.temperature_c);
        BigEndian::write_u16(&mut frame[12..14], self.temperature_f);
        BigEndian::write_u16(&mut frame[14..16], self.screen_group);
        for (i, group) in self.groups.iter().enumerate() {
            let base = GROUPS_OFFSET + GROUP_STRIDE * i;
            BigEndian::write_u32(&mut frame[base..base + 4], group.charge);
            BigEndian::write_u32(&mut frame[base + 4..base + 8], group.energy);
        }
        BigEndian::write_u16(&mut frame[96..98], self.data_plus_voltage);
        BigEndian::write_u16(&mut frame[98..100], self.data_minus_voltage);
        BigEndian::write_u16(&mut frame[100..102], self.charge_mode);
        BigEndian::write_u32(&mut frame[102..106], self.recording_charge);
        BigEndian::write_u32(&mut frame[106..110], self.recording_energy);
        BigEndian::write_u16(&mut frame[110..112], self.recording_threshold);
        BigEndian::write_u32(&mut frame[112..116], self.recording_runtime);
        BigEndian::write_u16(&mut frame[116..118], self.recording_enabled);
        BigEndian::write_u16(&mut frame[118..120], self.screen_timeout);
        BigEndian::write_u16(&mut frame[120..122], self.screen_brightness);
        BigEndian::write_u32(&mut frame[122..126], self.resistance);
        BigEndian::write_u16(&mut frame[126..128], self.screen_page);
        frame
    }
}

/// Per-group accumulated charge (C) and energy (J)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupDataPoint {
    /// Coulombs
    pub charge: f64,
    /// Joules
    pub energy: f64,
}

/// Meter temperature
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    /// Degrees Celsius
    pub celsius: f64,
    /// Degrees Fahrenheit
    pub fahrenheit: f64,
}

/// USB data line voltages in volts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataLines {
    /// D+ volts
    pub plus_voltage: f64,
    /// D- volts
    pub minus_voltage: f64,
}

/// Display settings reported by the meter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenState {
    /// Selected group, 0..=9
    pub group: u8,
    /// Inactivity before blanking; zero means never
    pub timeout: Duration,
    /// 0..=5
    pub brightness: u16,
    /// Page shown on the display
    pub page_index: u16,
}

/// Recording counters and trigger settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordingState {
    /// Coulombs
    pub charge: f64,
    /// Joules
    pub energy: f64,
    /// Time spent recording
    pub runtime: Duration,
    /// Amps
    pub current_threshold: f64,
    /// Whether recording is active
    pub enabled: bool,
}

/// One decoded status frame in SI units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Meter that sent the frame
    pub device_model: DeviceModel,
    /// Volts
    pub voltage: f64,
    /// Amps
    pub current: f64,
    /// Watts
    pub power: f64,
    /// Meter temperature
    pub temperature: Temperature,
    /// Accumulated counters for each group
    pub groups: Vec<GroupDataPoint>,
    /// USB data line voltages
    pub data_lines: DataLines,
    /// Detected charge mode
    pub charge_mode: ChargeMode,
    /// Display settings
    pub screen: ScreenState,
    /// Ohms
    pub resistance: f64,
    /// Recording counters and settings
    pub recording: RecordingState,
    /// Integer fields before scaling
    pub raw_values: RawDataPoint,
    /// The frame as received
    pub raw_data: Vec<u8>,
}

/// Decode a 130-byte status frame.
///
/// The result depends only on `data`: the model code at offset 0 selects
/// the voltage/current resolution and everything else is fixed scaling.
pub fn decode_frame(data: &[u8]) -> Result<DataPoint, ProtocolError> {
    if data.len() != FRAME_LENGTH {
        return Err(ProtocolError::InvalidFrame {
            expected: FRAME_LENGTH,
            actual: data.len(),
        });
    }

    let raw = RawDataPoint::read(data);
    let model = DeviceModel::from_code(raw.device_model);

    Ok(DataPoint {
        device_model: model,
        voltage: raw.voltage as f64 / model.voltage_divisor(),
        current: raw.current as f64 / model.current_divisor(),
        power: raw.power as f64 / 1000.0,
        temperature: Temperature {
            celsius: raw.temperature_c as f64,
            fahrenheit: raw.temperature_f as f64,
        },
        groups: raw
            .groups
            .iter()
            .map(|g| GroupDataPoint {
                charge: g.charge as f64 / MILLI_HOURS_TO_SECONDS,
                energy: g.energy as f64 / MILLI_HOURS_TO_SECONDS,
            })
            .collect(),
        data_lines: DataLines {
            plus_voltage: raw.data_plus_voltage as f64 / 100.0,
            minus_voltage: raw.data_minus_voltage as f64 / 100.0,
        },
        charge_mode: ChargeMode::from_code(raw.charge_mode),
        screen: ScreenState {
            group: (raw.screen_group & 0xFF) as u8,
            timeout: Duration::from_secs(raw.screen_timeout as u64 * 60),
            brightness: raw.screen_brightness,
            page_index: raw.screen_page,
        },
        resistance: raw.resistance as f64 / 10.0,
        recording: RecordingState {
            charge: raw.recording_charge as f64 / MILLI_HOURS_TO_SECONDS,
            energy: raw.recording_energy as f64 / MILLI_HOURS_TO_SECONDS,
            runtime: Duration::from_secs(raw.recording_runtime as u64),
            current_threshold: raw.recording_threshold as f64 / 100.0,
            enabled: raw.recording_enabled != 0,
        },
        raw_values: raw,
        raw_data: data.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(model: u16, voltage: u16, current: u16) -> [u8; FRAME_LENGTH] {
        let mut frame = [0u8; FRAME_LENGTH];
        BigEndian::write_u16(&mut frame[0..2], model);
        BigEndian::write_u16(&mut frame[2..4], voltage);
        BigEndian::write_u16(&mut frame[4..6], current);
        frame
    }

    #[test]
    fn test_um25c_scaling() {
        let point = decode_frame(&frame_with(2505, 5000, 1000)).unwrap();
        assert_eq!(point.device_model, DeviceModel::Um25c);
        assert_eq!(point.voltage, 5.0);
        assert_eq!(point.current, 0.1);
    }

    #[test]
    fn test_model_selects_divisor() {
        let um24 = decode_frame(&frame_with(2403, 500, 100)).unwrap();
        assert_eq!(um24.device_model, DeviceModel::Um24c);
        assert_eq!(um24.voltage, 5.0);
        assert_eq!(um24.current, 0.1);

        let um34 = decode_frame(&frame_with(3404, 500, 100)).unwrap();
        assert_eq!(um34.voltage, 5.0);

        let unknown = decode_frame(&frame_with(1234, 500, 100)).unwrap();
        assert_eq!(unknown.device_model, DeviceModel::Unknown);
        assert_eq!(unknown.raw_values.device_model, 1234);
        assert_eq!(unknown.voltage, 5.0);
    }

    #[test]
    fn test_decode_is_pure() {
        let mut frame = frame_with(2505, 5123, 4321);
        frame[100..102].copy_from_slice(&2u16.to_be_bytes());
        frame[122..126].copy_from_slice(&123_456u32.to_be_bytes());
        let a = decode_frame(&frame).unwrap();
        let b = decode_frame(&frame).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.raw_values, b.raw_values);
        assert_eq!(a.raw_data, frame.to_vec());
    }

    #[test]
    fn test_group_and_recording_conversion() {
        let mut raw = RawDataPoint {
            device_model: 2505,
            screen_group: 0x0103,
            recording_charge: 3_600_000,
            recording_energy: 7_200_000,
            recording_threshold: 15,
            recording_runtime: 90,
            recording_enabled: 1,
            screen_timeout: 2,
            resistance: 505,
            charge_mode: 2,
            data_plus_voltage: 60,
            ..Default::default()
        };
        raw.groups[4] = RawGroup {
            charge: 1000,
            energy: 36_000,
        };

        let point = decode_frame(&raw.to_frame()).unwrap();
        assert_eq!(point.groups.len(), GROUP_COUNT);
        assert!((point.groups[4].charge - 1000.0 / 3_600_000.0).abs() < 1e-12);
        assert!((point.groups[4].energy - 0.01).abs() < 1e-12);
        assert_eq!(point.groups[0].charge, 0.0);
        assert_eq!(point.recording.charge, 1.0);
        assert_eq!(point.recording.energy, 2.0);
        assert_eq!(point.recording.runtime, Duration::from_millis(90_000));
        assert_eq!(point.recording.current_threshold, 0.15);
        assert!(point.recording.enabled);
        assert_eq!(point.screen.group, 3);
        assert_eq!(point.screen.timeout, Duration::from_millis(120_000));
        assert_eq!(point.resistance, 50.5);
        assert_eq!(point.charge_mode, ChargeMode::Qc3_0);
        assert_eq!(point.data_lines.plus_voltage, 0.6);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let err = decode_frame(&[0u8; 129]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidFrame {
                expected: 130,
                actual: 129
            }
        ));
    }

    #[test]
    fn test_charge_mode_out_of_range() {
        assert_eq!(ChargeMode::from_code(9), ChargeMode::Unknown);
        assert_eq!(ChargeMode::from_code(8), ChargeMode::Samsung);
    }
}
