use std::any::Any;

use crate::registry::{RegistryError, RpcContext, TypeRegistry};
use crate::rpc::RpcError;
use crate::scene::Entity;
use crate::value::Value;

use super::{NetworkData, Payload, PayloadError, read_field};

const TEXT: &str = "TX";
const TOGGLE_MODE: &str = "TM";
const ACTION_MODE: &str = "AM";
const BUTTON_MASK: &str = "BM";
const ALIGNMENT: &str = "AL";

pub const SET_TEXT_METHOD: &str = "SetText";
pub const PRESS_METHOD: &str = "Press";
pub const TOGGLED_METHOD: &str = "Toggled";

/// Replicated push-button state. Starts dirty so the first cycle publishes it.
#[derive(Debug, Clone)]
pub struct ButtonSync {
    pub text: String,
    pub toggle_mode: bool,
    pub action_mode: i32,
    pub button_mask: i32,
    pub alignment: i32,
    presses: u32,
    toggled_on: bool,
    dirty: bool,
}

impl Default for ButtonSync {
    fn default() -> Self {
        Self {
            text: String::new(),
            toggle_mode: false,
            action_mode: 1,
            button_mask: 1,
            alignment: 1,
            presses: 0,
            toggled_on: false,
            dirty: true,
        }
    }
}

impl ButtonSync {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.dirty = true;
    }

    pub fn press(&mut self) {
        self.presses += 1;
    }

    pub fn presses(&self) -> u32 {
        self.presses
    }

    pub fn toggle(&mut self, on: bool) {
        self.toggled_on = on;
    }

    pub fn is_toggled_on(&self) -> bool {
        self.toggled_on
    }
}

impl NetworkData for ButtonSync {
    fn network_update(&self) -> bool {
        self.dirty
    }

    fn set_network_update(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    fn write_payload(&self, _host: &Entity) -> Payload {
        let mut payload = Payload::new();
        payload.insert(TEXT.into(), self.text.clone().into());
        payload.insert(TOGGLE_MODE.into(), self.toggle_mode.into());
        payload.insert(ACTION_MODE.into(), self.action_mode.into());
        payload.insert(BUTTON_MASK.into(), self.button_mask.into());
        payload.insert(ALIGNMENT.into(), self.alignment.into());
        payload
    }

    fn read_payload(&mut self, _host: &mut Entity, payload: &Payload) -> Result<(), PayloadError> {
        self.text = read_field(payload, TEXT)?;
        self.toggle_mode = read_field(payload, TOGGLE_MODE)?;
        self.action_mode = read_field(payload, ACTION_MODE)?;
        self.button_mask = read_field(payload, BUTTON_MASK)?;
        self.alignment = read_field(payload, ALIGNMENT)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn set_text(ctx: &mut RpcContext<'_>, args: &[Value]) -> Result<(), RpcError> {
    let text = args[0]
        .as_str()
        .ok_or_else(|| RpcError::argument(0, "String", &args[0]))?;
    ctx.capability_mut::<ButtonSync>()?.set_text(text);
    Ok(())
}

fn press(ctx: &mut RpcContext<'_>, _args: &[Value]) -> Result<(), RpcError> {
    let button = ctx.capability_mut::<ButtonSync>()?;
    button.press();
    let presses = button.presses();
    log::debug!("button {:?} pressed ({presses} total)", ctx.handle);
    Ok(())
}

fn toggled(ctx: &mut RpcContext<'_>, args: &[Value]) -> Result<(), RpcError> {
    let on = args[0]
        .as_bool()
        .ok_or_else(|| RpcError::argument(0, "Bool", &args[0]))?;
    ctx.capability_mut::<ButtonSync>()?.toggle(on);
    Ok(())
}

/// Gives `type_name` a [`ButtonSync`] with its `SetText`, `Press` and
/// `Toggled` methods.
pub fn register_button(types: &mut TypeRegistry, type_name: &str) -> Result<(), RegistryError> {
    types.register_capability(type_name, || Box::new(ButtonSync::default()))?;
    types.register_method(type_name, SET_TEXT_METHOD, 1, set_text)?;
    types.register_method(type_name, PRESS_METHOD, 0, press)?;
    types.register_method(type_name, TOGGLED_METHOD, 1, toggled)
}
