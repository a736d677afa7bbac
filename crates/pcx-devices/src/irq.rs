/// A single interrupt request line into the interrupt controller.
///
/// Devices hold the line; the sink decides what asserting it means
/// (typically setting an IRR bit on the PIC, possibly with an
/// acknowledgment delay).
pub trait IrqLine {
    fn set_level(&self, level: bool);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::IrqLine;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Test double recording the most recent line level.
    #[derive(Clone, Default)]
    pub struct RecordedIrq(Rc<Cell<bool>>);

    impl RecordedIrq {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn level(&self) -> bool {
            self.0.get()
        }
    }

    impl IrqLine for RecordedIrq {
        fn set_level(&self, level: bool) {
            self.0.set(level);
        }
    }
}
