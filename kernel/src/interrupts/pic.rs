//! The pair of chained 8259 interrupt controllers.

use spin::Mutex;

use crate::arch::port::{io_wait, Port};
use crate::constants::idt::{PIC_1_OFFSET, PIC_2_OFFSET};
use crate::constants::ports::{PIC1_COMMAND, PIC1_DATA, PIC2_COMMAND, PIC2_DATA};

const ICW1_INIT: u8 = 0x11;
const ICW4_8086: u8 = 0x01;
const END_OF_INTERRUPT: u8 = 0x20;

struct Pic {
    offset: u8,
    command: Port,
    data: Port,
}

impl Pic {
    fn handles(&self, vector: u8) -> bool {
        (self.offset..self.offset + 8).contains(&vector)
    }
}

pub struct ChainedPics {
    pics: [Pic; 2],
}

impl ChainedPics {
    pub const fn new(offset1: u8, offset2: u8) -> Self {
        ChainedPics {
            pics: [
                Pic {
                    offset: offset1,
                    command: Port::new(PIC1_COMMAND),
                    data: Port::new(PIC1_DATA),
                },
                Pic {
                    offset: offset2,
                    command: Port::new(PIC2_COMMAND),
                    data: Port::new(PIC2_DATA),
                },
            ],
        }
    }

    /// Remaps both controllers to their offsets and applies `masks`
    /// (a set bit masks the line).
    ///
    /// # Safety
    ///
    /// Reprograms interrupt routing for the whole machine.
    pub unsafe fn initialize(&mut self, masks: [u8; 2]) {
        let [primary, secondary] = &self.pics;

        primary.command.write(ICW1_INIT);
        io_wait();
        secondary.command.write(ICW1_INIT);
        io_wait();
        primary.data.write(primary.offset);
        io_wait();
        secondary.data.write(secondary.offset);
        io_wait();
        // Secondary on line 2 of the primary.
        primary.data.write(4);
        io_wait();
        secondary.data.write(2);
        io_wait();
        primary.data.write(ICW4_8086);
        io_wait();
        secondary.data.write(ICW4_8086);
        io_wait();

        primary.data.write(masks[0]);
        secondary.data.write(masks[1]);
    }

    pub fn handles_interrupt(&self, vector: u8) -> bool {
        self.pics.iter().any(|pic| pic.handles(vector))
    }

    /// # Safety
    ///
    /// Must only acknowledge the interrupt being serviced.
    pub unsafe fn notify_end_of_interrupt(&mut self, vector: u8) {
        if !self.handles_interrupt(vector) {
            return;
        }
        if self.pics[1].handles(vector) {
            self.pics[1].command.write(END_OF_INTERRUPT);
        }
        self.pics[0].command.write(END_OF_INTERRUPT);
    }
}

pub static PICS: Mutex<ChainedPics> = Mutex::new(ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_ranges() {
        let pics = ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET);
        assert!(pics.handles_interrupt(0x20));
        assert!(pics.handles_interrupt(0x2F));
        assert!(!pics.handles_interrupt(0x30));
        assert!(!pics.handles_interrupt(0x0E));
        assert!(pics.pics[1].handles(0x28));
        assert!(!pics.pics[1].handles(0x27));
    }
}
