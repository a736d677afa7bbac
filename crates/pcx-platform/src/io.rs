use std::collections::HashMap;

/// A device reachable through x86 `in`/`out` instructions.
///
/// One handler owns exactly one port; multi-port devices register one wrapper
/// per port sharing the model behind `Rc<RefCell<_>>`.
pub trait PortIoDevice {
    fn read(&mut self, port: u16, size: u8) -> u32;
    fn write(&mut self, port: u16, size: u8, value: u32);

    /// Reset the device back to its power-on state.
    fn reset(&mut self) {}
}

/// Port-mapped I/O bus. Every port access maps to exactly one handler.
///
/// Unmapped reads float the bus high (all ones), matching ISA behavior that
/// firmware probes rely on.
pub struct IoPortBus {
    devices: HashMap<u16, Box<dyn PortIoDevice>>,
}

impl IoPortBus {
    pub fn new() -> Self {
        Self {
            devices: HashMap::new(),
        }
    }

    pub fn register(&mut self, port: u16, device: Box<dyn PortIoDevice>) {
        self.devices.insert(port, device);
    }

    /// Removes the handler for `port`, returning it if one was mapped.
    pub fn unregister(&mut self, port: u16) -> Option<Box<dyn PortIoDevice>> {
        self.devices.remove(&port)
    }

    /// Registers a handler for each port of a contiguous window.
    ///
    /// The factory runs once per port, so callers can build per-port wrapper
    /// devices over one shared model.
    pub fn register_shared_range<F>(&mut self, start: u16, len: u16, mut make: F)
    where
        F: FnMut(u16) -> Box<dyn PortIoDevice>,
    {
        for offset in 0..len {
            let port = start.wrapping_add(offset);
            self.register(port, make(port));
        }
    }

    pub fn read(&mut self, port: u16, size: u8) -> u32 {
        // The x86 ISA only produces sizes {1,2,4}; anything else is treated
        // as an unmapped access rather than forwarded into device models.
        if size == 0 {
            return 0;
        }
        if !matches!(size, 1 | 2 | 4) {
            return 0xFFFF_FFFF;
        }
        match self.devices.get_mut(&port) {
            Some(dev) => dev.read(port, size),
            None => match size {
                1 => 0xFF,
                2 => 0xFFFF,
                _ => 0xFFFF_FFFF,
            },
        }
    }

    pub fn write(&mut self, port: u16, size: u8, value: u32) {
        if !matches!(size, 1 | 2 | 4) {
            return;
        }
        if let Some(dev) = self.devices.get_mut(&port) {
            dev.write(port, size, value);
        }
    }

    pub fn read_u8(&mut self, port: u16) -> u8 {
        self.read(port, 1) as u8
    }

    pub fn write_u8(&mut self, port: u16, value: u8) {
        self.write(port, 1, value as u32);
    }

    pub fn reset(&mut self) {
        for dev in self.devices.values_mut() {
            dev.reset();
        }
    }
}

impl Default for IoPortBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Latch {
        value: Rc<RefCell<u8>>,
    }

    impl PortIoDevice for Latch {
        fn read(&mut self, _port: u16, _size: u8) -> u32 {
            u32::from(*self.value.borrow())
        }

        fn write(&mut self, _port: u16, _size: u8, value: u32) {
            *self.value.borrow_mut() = value as u8;
        }

        fn reset(&mut self) {
            *self.value.borrow_mut() = 0;
        }
    }

    #[test]
    fn dispatch_and_reset() {
        let value = Rc::new(RefCell::new(0u8));
        let mut bus = IoPortBus::new();
        bus.register(
            0x61,
            Box::new(Latch {
                value: value.clone(),
            }),
        );

        bus.write_u8(0x61, 0x4D);
        assert_eq!(bus.read_u8(0x61), 0x4D);

        bus.reset();
        assert_eq!(bus.read_u8(0x61), 0x00);
    }

    #[test]
    fn unmapped_ports_float_high() {
        let mut bus = IoPortBus::new();
        assert_eq!(bus.read(0x300, 1), 0xFF);
        assert_eq!(bus.read(0x300, 2), 0xFFFF);
        assert_eq!(bus.read(0x300, 4), 0xFFFF_FFFF);
        // Writes to unmapped ports are dropped.
        bus.write(0x300, 1, 0x55);
    }

    #[test]
    fn invalid_sizes_are_not_dispatched() {
        let value = Rc::new(RefCell::new(0u8));
        let mut bus = IoPortBus::new();
        bus.register(
            0x40,
            Box::new(Latch {
                value: value.clone(),
            }),
        );

        bus.write(0x40, 3, 0x99);
        assert_eq!(*value.borrow(), 0);
        assert_eq!(bus.read(0x40, 3), 0xFFFF_FFFF);
        assert_eq!(bus.read(0x40, 0), 0);
    }

    #[test]
    fn shared_range_registers_every_port() {
        let value = Rc::new(RefCell::new(0u8));
        let mut bus = IoPortBus::new();
        bus.register_shared_range(0x80, 4, |_port| {
            Box::new(Latch {
                value: value.clone(),
            })
        });

        bus.write_u8(0x83, 0x12);
        assert_eq!(bus.read_u8(0x80), 0x12);
        assert!(bus.unregister(0x81).is_some());
        assert_eq!(bus.read_u8(0x81), 0xFF);
    }
}
