//! Acceptance filters for incoming messages
//!
//! Every receive buffer owns one filter made of an identifier and a mask.
//! A frame is stored in the buffer when all identifier bits selected by the
//! mask match and the identifier format (standard or extended) is the same.
//! With the RX FIFO enabled, eight more filters decide what enters the FIFO.

use crate::bus::Can;
use crate::message::id_word;
use crate::message_buffer::{Code, FIFO_SLOTS, RX_SLOTS};
use crate::reg::{offset, Cs, Registers, ID_STD_SHIFT};
use crate::Error;
use embedded_can::{ExtendedId, Id, StandardId};
use flexcan_core::{Dependencies, Monotonic};

/// Number of RX FIFO acceptance table entries
pub const FIFO_FILTERS: usize = FIFO_SLOTS.end - FIFO_SLOTS.start;

/// Position of the identifier in a FIFO table entry
const FIFO_STD_SHIFT: u32 = 19;
const FIFO_EXT_SHIFT: u32 = 1;
const FIFO_IDE: u32 = 1 << 30;
const FIFO_RTR: u32 = 1 << 31;

/// Identifier and mask of one acceptance filter.
///
/// A mask bit of 1 means the identifier bit must match, 0 means don't care.
/// The mask is expressed in identifier bits: at most 11 bits wide for
/// standard identifiers, 29 for extended ones.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Filter {
    /// Identifier to compare with
    pub id: Id,
    /// Bits of the identifier that must match
    pub mask: u32,
}

impl Filter {
    /// Filter matching the bits of `id` selected by `mask`
    pub fn new(id: impl Into<Id>, mask: u32) -> Self {
        Self {
            id: id.into(),
            mask,
        }
    }

    /// Filter matching exactly `id`
    pub fn exact(id: impl Into<Id>) -> Self {
        let id = id.into();
        Self {
            id,
            mask: id_width_mask(id),
        }
    }

    /// Filter matching every identifier of the same format as `id`
    pub fn accept_all(id: impl Into<Id>) -> Self {
        Self::new(id, 0)
    }

    fn check(&self) -> Result<(), Error> {
        if self.mask & !id_width_mask(self.id) != 0 {
            return Err(Error::InvalidParam);
        }
        Ok(())
    }

    /// Mask in the identifier word layout of the message buffers
    fn buffer_mask(&self) -> u32 {
        match self.id {
            Id::Standard(_) => self.mask << ID_STD_SHIFT,
            Id::Extended(_) => self.mask,
        }
    }

    /// Mask in the FIFO table layout. The identifier format always has to
    /// match; data and remote frames are both accepted.
    fn fifo_mask(&self) -> u32 {
        let shift = match self.id {
            Id::Standard(_) => FIFO_STD_SHIFT,
            Id::Extended(_) => FIFO_EXT_SHIFT,
        };
        FIFO_IDE | (self.mask << shift)
    }
}

fn id_width_mask(id: Id) -> u32 {
    match id {
        Id::Standard(_) => u32::from(StandardId::MAX.as_raw()),
        Id::Extended(_) => ExtendedId::MAX.as_raw(),
    }
}

/// FIFO table entry (format A) describing a frame with `id`
pub(crate) fn fifo_entry(id: Id, remote: bool) -> u32 {
    let rtr = if remote { FIFO_RTR } else { 0 };
    rtr | match id {
        Id::Standard(id) => u32::from(id.as_raw()) << FIFO_STD_SHIFT,
        Id::Extended(id) => FIFO_IDE | (id.as_raw() << FIFO_EXT_SHIFT),
    }
}

impl<R: Registers, D: Dependencies, T: Monotonic> Can<R, D, T> {
    /// Binds `filter` to receive buffer `slot` and arms the buffer.
    ///
    /// A frame the buffer held is discarded. The mask is written in freeze
    /// mode, so the bus is briefly halted. If freeze mode cannot be entered
    /// or left, the buffer keeps its previous filter and stays armed.
    pub fn configure_rx_filter(&mut self, slot: usize, filter: &Filter) -> Result<(), Error> {
        if !RX_SLOTS.contains(&slot) {
            return Err(Error::InvalidParam);
        }
        filter.check()?;
        self.ensure_initialized()?;

        let (previous, mask) = (self.regs.read(offset::rximr(slot)), filter.buffer_mask());
        if let Err(e) = self.with_freeze(|regs| regs.write(offset::rximr(slot), mask)) {
            // Only takes effect if the controller is stuck in freeze mode
            self.regs.write(offset::rximr(slot), previous);
            return Err(e);
        }
        self.set_code(slot, Code::RxInactive);
        self.regs.write(offset::mb_id(slot), id_word(filter.id));
        self.clear_flag(slot);

        let mut cs = Cs::default();
        cs.set_code(Code::RxEmpty.into());
        cs.set_ide(matches!(filter.id, Id::Extended(_)));
        self.regs.write(offset::mb_cs(slot), cs.bits());
        log::debug!("CAN{} slot {} filter {:?}", self.instance(), slot, filter);
        Ok(())
    }

    /// Programs entry `index` of the RX FIFO acceptance table.
    ///
    /// All entries accept every frame after [`Can::init`]; narrowing one
    /// entry does not restrict the others.
    pub fn configure_fifo_filter(&mut self, index: usize, filter: &Filter) -> Result<(), Error> {
        if index >= FIFO_FILTERS {
            return Err(Error::InvalidParam);
        }
        filter.check()?;
        self.ensure_initialized()?;
        if !self.config().map_or(false, |c| c.rx_fifo) {
            return Err(Error::InvalidParam);
        }

        let (entry, mask) = (fifo_entry(filter.id, false), filter.fifo_mask());
        self.with_freeze(|regs| {
            regs.write(offset::fifo_table(index), entry);
            regs.write(offset::rximr(index), mask);
        })
    }
}
