//! Protocol commands
//!
//! Every meter command is a single opcode byte. Parameterised commands add
//! their argument to a base opcode, so each encoder validates the argument
//! range before producing the byte.
//!
//! Button clicks follow the `0xF0`-based opcode revision: `0xF1` is NEXT,
//! `0xF2` ROTATE, `0xF3` PREV and `0xF4` RESET_GROUP. `0xF0` itself is the
//! data-frame request.

use serde::{Deserialize, Serialize};

use super::ProtocolError;

const SELECT_GROUP_BASE: u8 = 0xA0;
const RECORD_CURRENT_BASE: u8 = 0xB0;
const BRIGHTNESS_BASE: u8 = 0xD0;
const BLANK_TIMEOUT_BASE: u8 = 0xE0;
const BUTTON_BASE: u8 = 0xF0;

/// Highest selectable group index
pub const MAX_GROUP: u8 = 9;

/// Highest record-current threshold step
pub const MAX_RECORD_CURRENT: u8 = 31;

/// Highest screen brightness level
pub const MAX_BRIGHTNESS: u8 = 5;

/// Longest screen blank timeout in minutes
pub const MAX_BLANK_TIMEOUT_MINUTES: u8 = 9;

/// Physical buttons on the meter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Button {
    /// Not a real button; has no click opcode
    Unknown = 0,
    /// Next screen
    Next = 1,
    /// Rotate the display
    Rotate = 2,
    /// Previous screen
    Prev = 3,
    /// Clear the selected group's counters
    ResetGroup = 4,
}

/// Commands understood by the meter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Switch the active charge/energy group
    SelectGroup(u8),

    /// Set the current threshold that starts recording
    SetRecordCurrent(u8),

    /// Set screen brightness
    SetScreenBrightness(u8),

    /// Set minutes of inactivity before the screen blanks (0 = never)
    SetScreenBlankTimeout(u8),

    /// Emulate a button press
    ClickButton(Button),

    /// Ask for the 130-byte status frame
    RequestData,
}

impl Command {
    /// Encode the command into its opcode byte
    pub fn encode(&self) -> Result<u8, ProtocolError> {
        match *self {
            Command::SelectGroup(n) => offset_opcode(SELECT_GROUP_BASE, n, MAX_GROUP, "Group index"),
            Command::SetRecordCurrent(n) => offset_opcode(
                RECORD_CURRENT_BASE,
                n,
                MAX_RECORD_CURRENT,
                "Record current threshold",
            ),
            Command::SetScreenBrightness(n) => {
                offset_opcode(BRIGHTNESS_BASE, n, MAX_BRIGHTNESS, "Brightness")
            }
            Command::SetScreenBlankTimeout(minutes) => offset_opcode(
                BLANK_TIMEOUT_BASE,
                minutes,
                MAX_BLANK_TIMEOUT_MINUTES,
                "Screen blank timeout",
            ),
            Command::ClickButton(Button::Unknown) => Err(ProtocolError::InvalidArgument(
                "Button UNKNOWN has no click opcode".to_string(),
            )),
            Command::ClickButton(btn) => Ok(BUTTON_BASE + btn as u8),
            Command::RequestData => Ok(BUTTON_BASE),
        }
    }

    /// Number of response bytes the meter sends back for this command
    pub fn response_length(&self) -> usize {
        match self {
            Command::RequestData => super::FRAME_LENGTH,
            _ => 0,
        }
    }
}

fn offset_opcode(base: u8, n: u8, max: u8, what: &str) -> Result<u8, ProtocolError> {
    if n > max {
        return Err(ProtocolError::InvalidArgument(format!(
            "{} out of bounds: {} (expected 0..={})",
            what, n, max
        )));
    }
    Ok(base + n)
}

/// Build the select-group command (`0xA0 + n`, n in 0..=9)
pub fn build_select_group(n: u8) -> Result<[u8; 1], ProtocolError> {
    Command::SelectGroup(n).encode().map(|b| [b])
}

/// Build the record-current threshold command (`0xB0 + n`, n in 0..=31)
pub fn build_set_record_current(n: u8) -> Result<[u8; 1], ProtocolError> {
    Command::SetRecordCurrent(n).encode().map(|b| [b])
}

/// Build the screen brightness command (`0xD0 + n`, n in 0..=5)
pub fn build_set_screen_brightness(n: u8) -> Result<[u8; 1], ProtocolError> {
    Command::SetScreenBrightness(n).encode().map(|b| [b])
}

/// Build the screen blank timeout command (`0xE0 + minutes`, minutes in 0..=9)
pub fn build_set_screen_blank_timeout(minutes: u8) -> Result<[u8; 1], ProtocolError> {
    Command::SetScreenBlankTimeout(minutes).encode().map(|b| [b])
}

/// Build a button click command (`0xF0 + btn`)
pub fn build_click_button(btn: Button) -> Result<[u8; 1], ProtocolError> {
    Command::ClickButton(btn).encode().map(|b| [b])
}

/// Build the data-frame request (`0xF0`)
pub fn build_request_data() -> [u8; 1] {
    [BUTTON_BASE]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_range_commands() {
        for n in 0..=MAX_GROUP {
            assert_eq!(build_select_group(n).unwrap(), [0xA0 + n]);
        }
        for n in 0..=MAX_RECORD_CURRENT {
            assert_eq!(build_set_record_current(n).unwrap(), [0xB0 + n]);
        }
        for n in 0..=MAX_BRIGHTNESS {
            assert_eq!(build_set_screen_brightness(n).unwrap(), [0xD0 + n]);
        }
        for n in 0..=MAX_BLANK_TIMEOUT_MINUTES {
            assert_eq!(build_set_screen_blank_timeout(n).unwrap(), [0xE0 + n]);
        }
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(matches!(
            build_select_group(10),
            Err(ProtocolError::InvalidArgument(_))
        ));
        assert!(matches!(
            build_set_record_current(32),
            Err(ProtocolError::InvalidArgument(_))
        ));
        assert!(matches!(
            build_set_screen_brightness(6),
            Err(ProtocolError::InvalidArgument(_))
        ));
        assert!(matches!(
            build_set_screen_blank_timeout(10),
            Err(ProtocolError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_button_opcodes() {
        assert_eq!(build_click_button(Button::Next).unwrap(), [0xF1]);
        assert_eq!(build_click_button(Button::Rotate).unwrap(), [0xF2]);
        assert_eq!(build_click_button(Button::Prev).unwrap(), [0xF3]);
        assert_eq!(build_click_button(Button::ResetGroup).unwrap(), [0xF4]);
    }

    #[test]
    fn test_unknown_button_does_not_alias_data_request() {
        let err = build_click_button(Button::Unknown).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidArgument(_)));
        assert_eq!(build_request_data(), [0xF0]);
    }

    #[test]
    fn test_response_length() {
        assert_eq!(Command::RequestData.response_length(), 130);
        assert_eq!(Command::SelectGroup(3).response_length(), 0);
    }
}
