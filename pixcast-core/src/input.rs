//! Viewer input messages.
//!
//! Browsers send small fixed-layout binary (or text) messages:
//!
//! | type | layout            | event                     |
//! |------|-------------------|---------------------------|
//! | 0x01 | `01 key`          | key down                  |
//! | 0x02 | `02 key`          | key up                    |
//! | 0x03 | `03 dx dy _`      | relative mouse move       |
//! | 0x04 | `04 mask`         | mouse button state        |
//! | 0x05 | `05 mask dx dy`   | joystick / gamepad state  |
//!
//! Deltas are signed bytes. Key codes are the browser's `keyCode`,
//! passed through untouched; mapping them is the renderer's business.

use bitflags::bitflags;

/// Capacity of the decoded-input channel.
pub const DEFAULT_INPUT_CAPACITY: usize = 32;

const MSG_KEY_DOWN: u8 = 0x01;
const MSG_KEY_UP: u8 = 0x02;
const MSG_MOUSE_MOVE: u8 = 0x03;
const MSG_MOUSE_BUTTONS: u8 = 0x04;
const MSG_JOYSTICK: u8 = 0x05;

bitflags! {
    /// Pressed-button mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Buttons: u8 {
        const PRIMARY   = 0x01;
        const SECONDARY = 0x02;
        const MIDDLE    = 0x04;
        const _ = !0;
    }
}

/// One decoded input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    KeyDown(u8),
    KeyUp(u8),
    MouseMove { dx: i8, dy: i8 },
    MouseButtons(Buttons),
    Joystick { buttons: Buttons, dx: i8, dy: i8 },
}

/// Decode one message. Returns `None` for unknown types and short
/// messages.
pub fn decode(data: &[u8]) -> Option<InputEvent> {
    let (&kind, rest) = data.split_first()?;
    let event = match (kind, rest) {
        (MSG_KEY_DOWN, [key, ..]) => InputEvent::KeyDown(*key),
        (MSG_KEY_UP, [key, ..]) => InputEvent::KeyUp(*key),
        (MSG_MOUSE_MOVE, [dx, dy, _, ..]) => InputEvent::MouseMove {
            dx: *dx as i8,
            dy: *dy as i8,
        },
        (MSG_MOUSE_BUTTONS, [mask, ..]) => InputEvent::MouseButtons(Buttons::from_bits_retain(*mask)),
        (MSG_JOYSTICK, [mask, dx, dy, ..]) => InputEvent::Joystick {
            buttons: Buttons::from_bits_retain(*mask),
            dx: *dx as i8,
            dy: *dy as i8,
        },
        _ => return None,
    };
    Some(event)
}
