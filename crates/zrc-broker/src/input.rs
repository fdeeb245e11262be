//! Caller-facing input events and their translation to provider input.

use serde::{Deserialize, Serialize};

use crate::provider::{KeyAction, MouseAction, MouseButton, ProviderInput};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Modifiers {
    pub shift: bool,
    pub control: bool,
    pub alt: bool,
    pub meta: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonAction {
    Press,
    Release,
    Click,
    DoubleClick,
}

/// Input as submitted by a viewer, tagged by `type`.
///
/// Unrecognized tags deserialize to `Unsupported` rather than failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    PointerMove {
        x: i32,
        y: i32,
    },
    PointerButton {
        x: i32,
        y: i32,
        button: MouseButton,
        action: ButtonAction,
    },
    PointerScroll {
        x: i32,
        y: i32,
        delta: i32,
    },
    KeyDown {
        code: u32,
        #[serde(default)]
        modifiers: Modifiers,
    },
    KeyUp {
        code: u32,
        #[serde(default)]
        modifiers: Modifiers,
    },
    #[serde(other)]
    Unsupported,
}

impl InputEvent {
    /// Provider representation, or `None` if the event cannot be forwarded.
    pub fn to_provider(&self) -> Option<ProviderInput> {
        let input = match *self {
            InputEvent::PointerMove { x, y } => ProviderInput::Mouse {
                x,
                y,
                button: MouseButton::None,
                action: MouseAction::Move,
                wheel_delta: 0,
            },
            InputEvent::PointerButton { button: MouseButton::None, .. } => return None,
            InputEvent::PointerButton { x, y, button, action } => ProviderInput::Mouse {
                x,
                y,
                button,
                action: match action {
                    ButtonAction::Press => MouseAction::Press,
                    ButtonAction::Release => MouseAction::Release,
                    ButtonAction::Click => MouseAction::Click,
                    ButtonAction::DoubleClick => MouseAction::DoubleClick,
                },
                wheel_delta: 0,
            },
            InputEvent::PointerScroll { x, y, delta } => ProviderInput::Mouse {
                x,
                y,
                button: MouseButton::None,
                action: MouseAction::Wheel,
                wheel_delta: delta,
            },
            InputEvent::KeyDown { code, modifiers } => key(code, KeyAction::Press, modifiers),
            InputEvent::KeyUp { code, modifiers } => key(code, KeyAction::Release, modifiers),
            InputEvent::Unsupported => return None,
        };
        Some(input)
    }
}

fn key(code: u32, action: KeyAction, modifiers: Modifiers) -> ProviderInput {
    ProviderInput::Keyboard {
        key_code: code,
        action,
        ctrl: modifiers.control,
        alt: modifiers.alt,
        shift: modifiers.shift,
        meta: modifiers.meta,
    }
}
