use std::cell::Cell;
use std::rc::Rc;

/// Cloneable handle to the A20 address-line gate.
///
/// The keyboard controller's output port (and, on some models, a dedicated
/// system-control port) drives this gate; the memory system observes it when
/// masking physical addresses. The handle only carries the line state; the
/// bus side decides what "disabled" means for address wrap-around.
#[derive(Debug, Clone)]
pub struct A20GateHandle {
    enabled: Rc<Cell<bool>>,
}

impl A20GateHandle {
    /// Creates a gate in the given initial state. Real hardware powers on
    /// with A20 disabled (8086 wrap-around compatibility).
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Rc::new(Cell::new(enabled)),
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled.get()
    }

    #[inline]
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }
}

impl Default for A20GateHandle {
    fn default() -> Self {
        Self::new(false)
    }
}
