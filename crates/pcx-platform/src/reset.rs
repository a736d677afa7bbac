use std::cell::Cell;
use std::rc::Rc;

/// Reset request kind emitted by chipset devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Reset the CPU core while leaving device state intact (the 8042
    /// output-port pulse path).
    Cpu,
    /// Full system reset (CPU + devices + firmware re-entry).
    System,
}

/// Sink for reset requests raised from inside port I/O handlers.
///
/// Devices must not reset the machine directly from an I/O handler while the
/// bus router may still hold borrows. They report the request here and the
/// platform loop applies it at a safe boundary.
pub trait PlatformResetSink {
    fn request_reset(&mut self, kind: ResetKind);
}

impl<F> PlatformResetSink for F
where
    F: FnMut(ResetKind),
{
    fn request_reset(&mut self, kind: ResetKind) {
        self(kind);
    }
}

/// Cloneable single-slot latch bridging device reset requests into the
/// platform loop. [`ResetKind::System`] wins if both kinds are requested
/// before the loop consumes the latch.
#[derive(Debug, Clone, Default)]
pub struct ResetLatch {
    pending: Rc<Cell<Option<ResetKind>>>,
}

impl ResetLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pending request without consuming it.
    pub fn peek(&self) -> Option<ResetKind> {
        self.pending.get()
    }

    /// Takes and clears the pending request.
    pub fn take(&self) -> Option<ResetKind> {
        self.pending.replace(None)
    }

    pub fn clear(&self) {
        self.pending.set(None);
    }
}

impl PlatformResetSink for ResetLatch {
    fn request_reset(&mut self, kind: ResetKind) {
        let merged = match (self.pending.get(), kind) {
            (Some(ResetKind::System), _) | (_, ResetKind::System) => ResetKind::System,
            _ => ResetKind::Cpu,
        };
        self.pending.set(Some(merged));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_reset_wins_over_cpu_reset() {
        let mut latch = ResetLatch::new();
        latch.request_reset(ResetKind::Cpu);
        latch.request_reset(ResetKind::System);
        assert_eq!(latch.peek(), Some(ResetKind::System));

        latch.request_reset(ResetKind::Cpu);
        assert_eq!(latch.take(), Some(ResetKind::System));
        assert_eq!(latch.take(), None);
    }

    #[test]
    fn closures_are_reset_sinks() {
        let mut seen = Vec::new();
        {
            let mut sink = |kind| seen.push(kind);
            PlatformResetSink::request_reset(&mut sink, ResetKind::Cpu);
        }
        assert_eq!(seen, vec![ResetKind::Cpu]);
    }
}
