use pretty_assertions::assert_eq;
use std::time::Duration;
use umlink_core::demo::{spawn_simulated_meter, MeterSimulator};
use umlink_core::protocol::{
    commands, decode_frame, Button, ChargeMode, Command, Connection, ConnectionConfig, DeviceModel,
    Fault, ProtocolError, RawDataPoint, FRAME_LENGTH,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn simulated(model: DeviceModel, write_chunk: usize) -> Connection {
    init_tracing();
    let transport = spawn_simulated_meter(MeterSimulator::with_seed(model, 11), write_chunk);
    Connection::new(Box::new(transport), ConnectionConfig::default()).unwrap()
}

#[test]
fn test_protocol_error_display() {
    let err = ProtocolError::OversizedBuffer {
        len: 1_048_577,
        max: 1_048_576,
    };
    assert_eq!(
        err.to_string(),
        "Too much unhandled data received: 1048577 bytes buffered, limit is 1048576"
    );
    assert_eq!(ProtocolError::ReadTimedOut.to_string(), "Read timed out");
    assert_eq!(
        ProtocolError::from(Fault::ConnectionClosed).to_string(),
        "Connection closed"
    );
}

#[test]
fn test_fault_serializes_for_event_consumers() {
    let json = serde_json::to_string(&Fault::WriteFailed("broken pipe".into())).unwrap();
    let back: Fault = serde_json::from_str(&json).unwrap();
    assert_eq!(back, Fault::WriteFailed("broken pipe".into()));
}

#[test]
fn test_command_table() {
    let cases = [
        (Command::SelectGroup(0), 0xA0),
        (Command::SelectGroup(9), 0xA9),
        (Command::SetRecordCurrent(0), 0xB0),
        (Command::SetRecordCurrent(31), 0xCF),
        (Command::SetScreenBrightness(5), 0xD5),
        (Command::SetScreenBlankTimeout(0), 0xE0),
        (Command::ClickButton(Button::Next), 0xF1),
        (Command::ClickButton(Button::Rotate), 0xF2),
        (Command::ClickButton(Button::Prev), 0xF3),
        (Command::ClickButton(Button::ResetGroup), 0xF4),
        (Command::RequestData, 0xF0),
    ];
    for (command, opcode) in cases {
        assert_eq!(command.encode().unwrap(), opcode, "{:?}", command);
    }
    assert_eq!(Command::RequestData.response_length(), FRAME_LENGTH);
    assert_eq!(Command::SelectGroup(1).response_length(), 0);
}

#[test]
fn test_builders_reject_out_of_range() {
    assert!(commands::build_select_group(10).is_err());
    assert!(commands::build_set_record_current(32).is_err());
    assert!(commands::build_set_screen_brightness(6).is_err());
    assert!(commands::build_set_screen_blank_timeout(10).is_err());
    assert!(commands::build_click_button(Button::Unknown).is_err());
    assert_eq!(commands::build_request_data(), [0xF0]);
}

#[test]
fn test_decode_known_frame() {
    let raw = RawDataPoint {
        device_model: 0x09C9,
        voltage: 5000,
        current: 1000,
        power: 500,
        temperature_c: 30,
        temperature_f: 86,
        screen_group: 2,
        charge_mode: 1,
        screen_timeout: 4,
        screen_brightness: 2,
        recording_threshold: 15,
        recording_enabled: 1,
        recording_runtime: 90,
        ..Default::default()
    };
    let point = decode_frame(&raw.to_frame()).unwrap();

    assert_eq!(point.device_model, DeviceModel::Um25c);
    assert!((point.voltage - 5.0).abs() < 1e-9);
    assert!((point.current - 0.1).abs() < 1e-9);
    assert!((point.power - 0.5).abs() < 1e-9);
    assert_eq!(point.charge_mode, ChargeMode::from_code(1));
    assert_eq!(point.screen.group, 2);
    assert_eq!(point.screen.timeout, Duration::from_secs(240));
    assert_eq!(point.screen.brightness, 2);
    assert!((point.recording.current_threshold - 0.15).abs() < 1e-9);
    assert!(point.recording.enabled);
    assert_eq!(point.recording.runtime, Duration::from_secs(90));
    assert_eq!(point.raw_data.len(), FRAME_LENGTH);
}

#[test]
fn test_decode_rejects_short_frame() {
    assert!(matches!(
        decode_frame(&[0u8; 129]),
        Err(ProtocolError::InvalidFrame {
            expected: 130,
            actual: 129
        })
    ));
}

#[tokio::test]
async fn test_read_data_from_simulated_um25c() {
    let conn = simulated(DeviceModel::Um25c, 7);

    let reading = conn.read_data().await.unwrap();
    assert_eq!(reading.point.device_model, DeviceModel::Um25c);
    assert!((reading.point.voltage - 5.0).abs() <= 0.021);
    assert!((reading.point.current - 1.0).abs() <= 0.0051);
    assert_eq!(conn.counters(), (1, FRAME_LENGTH as u64));

    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_settings_reach_the_meter() {
    let conn = simulated(DeviceModel::Um34c, 16);

    conn.select_group(3).await.unwrap();
    conn.set_screen_brightness(1).await.unwrap();
    conn.set_screen_blank_timeout(Duration::from_secs(5 * 60))
        .await
        .unwrap();
    conn.set_record_current(20).await.unwrap();
    conn.click_button(Button::Next).await.unwrap();

    let point = conn.read_data().await.unwrap().point;
    assert_eq!(point.device_model, DeviceModel::Um34c);
    assert_eq!(point.screen.group, 3);
    assert_eq!(point.screen.brightness, 1);
    assert_eq!(point.screen.timeout, Duration::from_secs(300));
    assert_eq!(point.screen.page_index, 1);
    assert!((point.recording.current_threshold - 0.2).abs() < 1e-9);
    assert!(point.groups[3].charge > 0.0);

    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_consecutive_reads_accumulate_charge() {
    let conn = simulated(DeviceModel::Um24c, 130);

    let first = conn.read_data().await.unwrap();
    let second = conn.read_data().await.unwrap();
    assert!(second.timestamp >= first.timestamp);
    assert!(second.point.groups[0].charge > first.point.groups[0].charge);

    conn.click_button(Button::ResetGroup).await.unwrap();
    let third = conn.read_data().await.unwrap();
    // Reset clears the group, then this frame adds one more minute
    assert!(third.point.groups[0].charge < second.point.groups[0].charge);

    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_reading_serializes_flat() {
    let conn = simulated(DeviceModel::Um25c, 32);
    let reading = conn.read_data().await.unwrap();
    let json = serde_json::to_value(&reading).unwrap();
    assert!(json.get("timestamp").is_some());
    assert!(json.get("voltage").is_some());
    assert!(json.get("point").is_none());
    conn.close().await.unwrap();
}
