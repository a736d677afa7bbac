use std::cell::Cell;
use std::rc::Rc;

/// Shared view of the CPU's elapsed-cycle counter.
///
/// The chipset core is driven entirely by the CPU instruction-burst loop;
/// there is no wall-clock thread. The CPU advances this counter as it
/// executes and every timer model recomputes its state on demand from the
/// cycle delta since it was last programmed.
///
/// Cloning the handle shares the counter.
#[derive(Debug, Clone, Default)]
pub struct CycleClock {
    cycles: Rc<Cell<u64>>,
}

impl CycleClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Elapsed CPU cycles since power-on.
    #[inline]
    pub fn now_cycles(&self) -> u64 {
        self.cycles.get()
    }

    /// Advances the counter by `cycles`. Saturates rather than wrapping;
    /// `u64` cycles outlives any plausible session.
    #[inline]
    pub fn advance(&self, cycles: u64) {
        self.cycles.set(self.cycles.get().saturating_add(cycles));
    }

    /// Sets the counter, intended for save/restore. May move time backwards;
    /// callers must restore every timer model from the same snapshot.
    #[inline]
    pub fn set_now_cycles(&self, cycles: u64) {
        self.cycles.set(cycles);
    }
}
