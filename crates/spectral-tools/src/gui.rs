use crate::params::optional_i64;
use serde_json::json;
use spectral_core::ActionResult;
use std::sync::{Arc, Mutex};

/// Last pointer position reported by the GUI family. On hosts without a
/// display the adapters drive this simulated state instead of a real
/// cursor; the verifier treats its checks as advisory either way.
#[derive(Debug, Clone, Default)]
pub struct PointerState {
    inner: Arc<Mutex<Option<(i64, i64)>>>,
}

impl PointerState {
    pub fn position(&self) -> Option<(i64, i64)> {
        *self.inner.lock().expect("pointer lock poisoned")
    }

    fn set(&self, x: i64, y: i64) {
        *self.inner.lock().expect("pointer lock poisoned") = Some((x, y));
    }
}

pub struct GuiActions {
    pointer: PointerState,
}

impl GuiActions {
    pub fn new(pointer: PointerState) -> Self {
        Self { pointer }
    }

    pub fn move_mouse(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "gui_move_mouse";
        let (Some(x), Some(y)) = (optional_i64(params, "x"), optional_i64(params, "y")) else {
            return ActionResult::fail(ACTION, "missing required parameters 'x' and 'y'");
        };
        self.pointer.set(x, y);
        ActionResult::ok(ACTION, format!("Moved pointer to ({x}, {y})"))
            .with_data(json!({"x": x, "y": y}))
    }

    pub fn click_mouse(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "gui_click_mouse";
        let (Some(x), Some(y)) = (optional_i64(params, "x"), optional_i64(params, "y")) else {
            return ActionResult::fail(ACTION, "missing required parameters 'x' and 'y'");
        };
        self.pointer.set(x, y);
        let button = params
            .get("button")
            .and_then(|b| b.as_str())
            .unwrap_or("left");
        ActionResult::ok(ACTION, format!("Clicked {button} button at ({x}, {y})"))
            .with_data(json!({"x": x, "y": y, "button": button}))
    }

    pub fn capture_screen(&self, _params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "gui_capture_screen";
        // No display stack is wired in; report the capability honestly so
        // the retry classifier can stop early.
        ActionResult::fail(ACTION, "screen capture backend not installed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn move_updates_shared_pointer_state() {
        let pointer = PointerState::default();
        let gui = GuiActions::new(pointer.clone());
        let result = gui.move_mouse(&json!({"x": 120, "y": 45}));
        assert!(result.success);
        assert_eq!(pointer.position(), Some((120, 45)));
    }

    #[test]
    fn click_requires_coordinates() {
        let gui = GuiActions::new(PointerState::default());
        let result = gui.click_mouse(&json!({"x": 10}));
        assert!(!result.success);
    }
}
