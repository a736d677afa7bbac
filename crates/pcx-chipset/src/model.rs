use tracing::warn;

/// Machine generations this chipset layer reproduces. The model decides
/// which sub-components exist and where their ports live; it is resolved
/// once at construction and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineModel {
    /// Original PC: single PIC, single DMA controller, 8041-class keyboard
    /// logic behind the PPI, NMI mask at port 0xA0.
    Pc5150,
    /// XT: same chipset complement as the 5150.
    Xt5160,
    /// AT: dual PIC, dual DMA, 8042 keyboard controller, RTC/CMOS,
    /// FPU control ports.
    At5170,
}

impl MachineModel {
    /// Parses a model string. Unrecognized values fall back to the basic
    /// model rather than failing the machine.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "5150" | "pc" => Self::Pc5150,
            "5160" | "xt" => Self::Xt5160,
            "5170" | "at" => Self::At5170,
            other => {
                warn!(model = other, "unrecognized machine model, using 5150");
                Self::Pc5150
            }
        }
    }

    pub fn is_extended(self) -> bool {
        matches!(self, Self::At5170)
    }

    pub fn has_8042(self) -> bool {
        self.is_extended()
    }

    pub fn has_rtc(self) -> bool {
        self.is_extended()
    }

    pub fn has_second_pic(self) -> bool {
        self.is_extended()
    }

    pub fn has_second_dma(self) -> bool {
        self.is_extended()
    }

    /// IRQ1 acknowledgment delay, in instructions. 8042 firmware performs
    /// extra work between EOI and IRET, so the AT keyboard interrupt must
    /// lag further behind the buffer fill than the 8041's.
    pub fn keyboard_irq_delay(self) -> u32 {
        if self.is_extended() {
            128
        } else {
            4
        }
    }
}

/// Configuration DIP switch blocks, parsed from front-panel-style strings
/// ("0" open, "1" closed, switch 1 leftmost) into the bytes firmware reads
/// back through the PPI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DipSwitches {
    pub sw1: u8,
    pub sw2: u8,
}

impl DipSwitches {
    pub fn parse(sw1: &str, sw2: &str) -> Self {
        let default = Self::default();
        let sw1 = match parse_block(sw1) {
            Some(bits) => bits,
            None => {
                warn!(block = sw1, "bad SW1 DIP string, using default");
                default.sw1
            }
        };
        let sw2 = match parse_block(sw2) {
            Some(bits) => bits,
            None => {
                warn!(block = sw2, "bad SW2 DIP string, using default");
                default.sw2
            }
        };
        Self { sw1, sw2 }
    }
}

impl Default for DipSwitches {
    /// Two floppy drives, 80-column color, full planar memory, no FPU.
    fn default() -> Self {
        Self {
            sw1: 0b0110_1100,
            sw2: 0b0000_0000,
        }
    }
}

fn parse_block(s: &str) -> Option<u8> {
    if s.len() != 8 {
        return None;
    }
    let mut bits = 0u8;
    for (i, c) in s.chars().enumerate() {
        match c {
            '1' => bits |= 1 << i,
            '0' => {}
            _ => return None,
        }
    }
    Some(bits)
}
