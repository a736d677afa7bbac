//! Platform infrastructure shared by the chipset device models: port-mapped
//! I/O dispatch, the virtual cycle clock, the A20 gate handle, and reset
//! request plumbing.

#![forbid(unsafe_code)]

pub mod chipset;
pub mod clock;
pub mod io;
pub mod reset;

pub use chipset::A20GateHandle;
pub use clock::CycleClock;
pub use io::{IoPortBus, PortIoDevice};
pub use reset::{PlatformResetSink, ResetKind, ResetLatch};
