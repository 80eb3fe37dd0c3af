//! Message buffer pool layout and codes
//!
//! The controller has 32 message buffers. By convention they are split into
//! - `0..8`: reserved, used by the RX FIFO engine when it is enabled
//! - `8..16`: transmit buffers
//! - `16..32`: receive buffers, each with its own acceptance filter

use crate::bus::Can;
use crate::reg::{offset, Cs, Registers};
use crate::Error;
use core::ops::Range;
use flexcan_core::{Dependencies, Monotonic};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Number of message buffers
pub const NUM_SLOTS: usize = 32;
/// Buffers available to [`Can::send`]
pub const TX_SLOTS: Range<usize> = 8..16;
/// Buffers available to [`Can::receive`] and
/// [`Can::configure_rx_filter`]
pub const RX_SLOTS: Range<usize> = 16..32;
/// Buffers taken over by the RX FIFO engine when it is enabled
pub const FIFO_SLOTS: Range<usize> = 0..8;

/// Message buffer code
///
/// Receive codes may additionally carry the busy bit (`0b0001`) while the
/// controller is moving a frame into the buffer; [`Code::from_raw`] strips
/// it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Code {
    /// Receive buffer not active
    RxInactive = 0b0000,
    /// Receive buffer active and empty
    RxEmpty = 0b0100,
    /// Receive buffer holds a frame
    RxFull = 0b0010,
    /// A frame was overwritten before being read
    RxOverrun = 0b0110,
    /// Remote request frame answered automatically
    RxRanswer = 0b1010,
    /// Transmit buffer not active
    TxInactive = 0b1000,
    /// Transmission aborted
    TxAbort = 0b1001,
    /// Transmit the frame once
    TxOnce = 0b1100,
    /// Transmit a response frame to a remote request
    TxTanswer = 0b1110,
}

impl Code {
    /// Busy bit of receive codes
    pub const RX_BUSY: u8 = 0b0001;

    /// Decodes the 4-bit code field. Returns `None` for reserved values.
    pub fn from_raw(raw: u8) -> Option<Self> {
        let raw = raw & 0xf;
        let raw = if raw & 0b1000 == 0 {
            raw & !Self::RX_BUSY
        } else {
            raw
        };
        Self::try_from(raw).ok()
    }

    /// `true` for codes describing an idle buffer
    pub fn is_inactive(self) -> bool {
        matches!(self, Code::TxInactive | Code::RxInactive)
    }
}

/// A set of message buffers, as found in the flag and mask registers.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct SlotSet(pub u32);

impl FromIterator<usize> for SlotSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut set = 0_u32;
        for i in iter.into_iter().filter(|i| *i < NUM_SLOTS) {
            set |= 1u32 << i;
        }
        SlotSet(set)
    }
}

impl SlotSet {
    /// Set containing only `slot`
    pub fn single(slot: usize) -> Self {
        [slot].into_iter().collect()
    }

    /// `true` if `slot` is in the set
    pub fn contains(&self, slot: usize) -> bool {
        slot < NUM_SLOTS && self.0 & (1 << slot) != 0
    }

    /// An iterator visiting all elements in ascending order.
    pub fn iter(&self) -> Iter {
        Iter {
            flags: *self,
            index: 0,
        }
    }
}

impl core::fmt::Debug for SlotSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// An iterator over the buffer indexes of a [`SlotSet`].
///
/// This `struct` is created by [`SlotSet::iter`].
pub struct Iter {
    flags: SlotSet,
    index: u8,
}

impl Iterator for Iter {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while usize::from(self.index) < NUM_SLOTS {
            let i = self.index;
            self.index += 1;
            if self.flags.0 & (1 << i) != 0 {
                return Some(i.into());
            }
        }
        None
    }
}

impl<R: Registers, D: Dependencies, T: Monotonic> Can<R, D, T> {
    /// Returns `true` unless the code of `slot` is TX_INACTIVE or
    /// RX_INACTIVE. Reserved codes count as busy.
    pub fn is_mb_busy(&self, slot: usize) -> Result<bool, Error> {
        if slot >= NUM_SLOTS {
            return Err(Error::InvalidParam);
        }
        self.ensure_initialized()?;
        Ok(!self.code(slot).map_or(false, Code::is_inactive))
    }

    /// Decoded code of `slot`
    pub(crate) fn code(&self, slot: usize) -> Option<Code> {
        Code::from_raw(Cs::from(self.regs.read(offset::mb_cs(slot))).code())
    }

    /// Writes only the code field of `slot`, leaving the rest of the control
    /// word cleared.
    pub(crate) fn set_code(&self, slot: usize, code: Code) {
        let mut cs = Cs::default();
        cs.set_code(code.into());
        self.regs.write(offset::mb_cs(slot), cs.bits());
    }

    /// `true` if the interrupt flag of `slot` is set
    pub(crate) fn flagged(&self, slot: usize) -> bool {
        SlotSet(self.regs.read(offset::IFLAG1)).contains(slot)
    }

    /// Clears the interrupt flag of `slot` (write 1 to clear)
    pub(crate) fn clear_flag(&self, slot: usize) {
        self.regs.write(offset::IFLAG1, SlotSet::single(slot).0);
    }

    /// Puts every buffer back into its idle state: transmit buffers
    /// TX_INACTIVE, all other buffers RX_INACTIVE with an exact-match mask.
    /// Must only be called in freeze mode.
    pub(crate) fn reset_message_buffers(&self) {
        for slot in 0..NUM_SLOTS {
            let code = if TX_SLOTS.contains(&slot) {
                Code::TxInactive
            } else {
                Code::RxInactive
            };
            self.set_code(slot, code);
            self.regs.write(offset::mb_id(slot), 0);
            self.regs.write(offset::mb_data(slot, 0), 0);
            self.regs.write(offset::mb_data(slot, 1), 0);
            self.regs.write(offset::rximr(slot), u32::MAX);
        }
        self.regs.write(offset::IFLAG1, u32::MAX);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_decode_with_and_without_busy_bit() {
        assert_eq!(Code::from_raw(0b0010), Some(Code::RxFull));
        assert_eq!(Code::from_raw(0b0011), Some(Code::RxFull));
        assert_eq!(Code::from_raw(0b0101), Some(Code::RxEmpty));
        assert_eq!(Code::from_raw(0b1001), Some(Code::TxAbort));
        assert_eq!(Code::from_raw(0b1111), None);
        assert_eq!(u8::from(Code::TxOnce), 0b1100);
    }

    #[test]
    fn slot_ranges_do_not_overlap() {
        assert_eq!(TX_SLOTS.end, RX_SLOTS.start);
        assert_eq!(FIFO_SLOTS.end, TX_SLOTS.start);
        assert_eq!(RX_SLOTS.end, NUM_SLOTS);
    }

    #[test]
    fn slot_set_iterates_in_order() {
        let set: SlotSet = [16, 8, 31, 40].into_iter().collect();
        assert_eq!(set.0, (1 << 8) | (1 << 16) | (1 << 31));
        let mut iter = set.iter();
        assert_eq!(iter.next(), Some(8));
        assert_eq!(iter.next(), Some(16));
        assert_eq!(iter.next(), Some(31));
        assert_eq!(iter.next(), None);
        assert_eq!(SlotSet(u32::MAX).iter().count(), 32);
        assert_eq!(SlotSet(0).iter().count(), 0);
    }
}
