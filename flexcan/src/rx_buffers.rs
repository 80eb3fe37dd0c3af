//! Reception through the message buffers in [`RX_SLOTS`] and the RX FIFO

use crate::bus::Can;
use crate::message::Message;
use crate::message_buffer::{Code, SlotSet, RX_SLOTS};
use crate::reg::{offset, Cs, Registers};
use crate::Error;
use flexcan_core::{Dependencies, Duration, Monotonic};

/// IFLAG1 bit signalling a frame at the FIFO output
pub(crate) const FIFO_AVAILABLE: usize = 5;
/// IFLAG1 bit signalling that the FIFO is almost full
pub(crate) const FIFO_WARNING: usize = 6;
/// IFLAG1 bit signalling that a frame was lost to a full FIFO
pub(crate) const FIFO_OVERFLOW: usize = 7;
/// Message buffer holding the FIFO output
const FIFO_OUTPUT: usize = 0;

impl<R: Registers, D: Dependencies, T: Monotonic> Can<R, D, T> {
    fn check_rx_slot(&self, slot: usize) -> Result<(), Error> {
        if !RX_SLOTS.contains(&slot) {
            return Err(Error::InvalidParam);
        }
        self.ensure_initialized()
    }

    /// Takes the frame stored in receive buffer `slot`.
    ///
    /// Fails with [`Error::NoMessage`] if the buffer has not received anything
    /// since the last call. A frame that overwrote an unread one is returned
    /// normally; the loss is logged.
    pub fn receive(&mut self, slot: usize) -> Result<Message, Error> {
        self.check_rx_slot(slot)?;
        if !self.flagged(slot) {
            return Err(Error::NoMessage);
        }
        let message = self.read_buffer(slot);
        self.clear_flag(slot);
        Ok(message)
    }

    /// Spins until receive buffer `slot` holds a frame or `timeout` passes.
    pub fn receive_blocking(&mut self, slot: usize, timeout: Duration) -> Result<Message, Error> {
        self.check_rx_slot(slot)?;
        self.wait_for(timeout, |regs| {
            SlotSet(regs.read(offset::IFLAG1)).contains(slot)
        })?;
        self.receive(slot)
    }

    /// Takes the oldest frame from the RX FIFO.
    ///
    /// Only available with [`CanConfig::rx_fifo`](crate::config::CanConfig)
    /// set; fails with [`Error::InvalidParam`] otherwise.
    pub fn receive_fifo(&mut self) -> Result<Message, Error> {
        self.ensure_initialized()?;
        if !self.config().map_or(false, |c| c.rx_fifo) {
            return Err(Error::InvalidParam);
        }

        let flags = SlotSet(self.regs.read(offset::IFLAG1));
        if flags.contains(FIFO_OVERFLOW) {
            log::warn!("CAN{} RX FIFO overflow, frames lost", self.instance());
            self.clear_flag(FIFO_OVERFLOW);
        }
        if flags.contains(FIFO_WARNING) {
            self.clear_flag(FIFO_WARNING);
        }
        if !flags.contains(FIFO_AVAILABLE) {
            return Err(Error::NoMessage);
        }
        let message = self.read_buffer(FIFO_OUTPUT);
        // Clearing the flag advances the FIFO
        self.clear_flag(FIFO_AVAILABLE);
        Ok(message)
    }

    /// Receive buffers holding an unread frame
    pub(crate) fn flagged_rx_slots(&self) -> SlotSet {
        let rx: SlotSet = RX_SLOTS.collect();
        SlotSet(self.regs.read(offset::IFLAG1) & rx.0)
    }

    /// Reads a message buffer in the order that locks it first and releases
    /// it last.
    fn read_buffer(&self, slot: usize) -> Message {
        let cs = Cs::from(self.regs.read(offset::mb_cs(slot)));
        let id = self.regs.read(offset::mb_id(slot));
        let data = [
            self.regs.read(offset::mb_data(slot, 0)),
            self.regs.read(offset::mb_data(slot, 1)),
        ];
        let _unlock = self.regs.read(offset::TIMER);

        if Code::from_raw(cs.code()) == Some(Code::RxOverrun) {
            log::warn!("CAN{} slot {} overrun, a frame was lost", self.instance(), slot);
        }
        let message = Message::decode(cs, id, data);
        log::trace!("CAN{} slot {} -> {:?}", self.instance(), slot, message);
        message
    }
}
