#![forbid(unsafe_code)]

pub mod dma;
pub mod i8042;
pub mod irq;
pub mod pic8259;
pub mod pit8253;
pub mod rtc_cmos;

pub use dma::{Dma8237, DmaDevice, DmaFetch, DmaMemory, DmaStore};
pub use i8042::{I8042, Kbc8041, KeyboardDevice, SystemControlSink};
pub use irq::IrqLine;
pub use pic8259::{DualPic8259, VectorPoll};
pub use pit8253::Pit8253;
pub use rtc_cmos::{RtcCmos, RtcDateTime};
