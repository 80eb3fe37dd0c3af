//! Transmission through the message buffers in [`TX_SLOTS`]

use crate::bus::Can;
use crate::message::{Message, MAX_DATA_LEN};
use crate::message_buffer::{Code, SlotSet, TX_SLOTS};
use crate::reg::{offset, Registers};
use crate::Error;
use flexcan_core::{Dependencies, Duration, Monotonic};

/// Outcome of [`Can::abort_transmission`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AbortStatus {
    /// The pending frame was withdrawn before reaching the bus
    Aborted,
    /// The frame had already won arbitration and was sent
    Transmitted,
    /// Nothing was pending
    Idle,
}

impl<R: Registers, D: Dependencies, T: Monotonic> Can<R, D, T> {
    fn check_tx_slot(&self, slot: usize) -> Result<(), Error> {
        if !TX_SLOTS.contains(&slot) {
            return Err(Error::InvalidParam);
        }
        self.ensure_initialized()
    }

    /// Puts `message` in transmit buffer `slot` to be sent on the bus.
    ///
    /// Fails with [`Error::Busy`] while the buffer still holds a frame, or
    /// while the completion of its previous frame has not been observed
    /// through [`Self::transmission_completed`], [`Self::send_blocking`] or
    /// a TX handler.
    pub fn send(&mut self, slot: usize, message: &Message) -> Result<(), Error> {
        if usize::from(message.len) > MAX_DATA_LEN {
            return Err(Error::InvalidParam);
        }
        self.check_tx_slot(slot)?;
        if !self.tx_idle(slot) {
            return Err(Error::Busy);
        }

        let [word0, word1] = message.data_words();
        self.regs.write(offset::mb_data(slot, 0), word0);
        self.regs.write(offset::mb_data(slot, 1), word1);
        self.regs.write(offset::mb_id(slot), message.id_word());
        // Writing the code commits the buffer to the controller
        self.regs.write(
            offset::mb_cs(slot),
            message.control_word(Code::TxOnce).bits(),
        );
        log::trace!("CAN{} slot {} <- {:?}", self.instance(), slot, message);
        Ok(())
    }

    /// Sends `message` and spins until the transmission completes or
    /// `timeout` passes. On [`Error::Timeout`] the frame stays pending; use
    /// [`Self::abort_transmission`] to withdraw it.
    pub fn send_blocking(
        &mut self,
        slot: usize,
        message: &Message,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.send(slot, message)?;
        self.wait_for(timeout, |regs| {
            SlotSet(regs.read(offset::IFLAG1)).contains(slot)
        })
        .map_err(|e| {
            log::debug!("CAN{} slot {} not transmitted in time", self.instance(), slot);
            e
        })?;
        self.clear_flag(slot);
        Ok(())
    }

    /// Returns `true` once the frame in `slot` has been sent, and
    /// acknowledges the completion so the buffer can be reused.
    pub fn transmission_completed(&mut self, slot: usize) -> Result<bool, Error> {
        self.check_tx_slot(slot)?;
        if !self.flagged(slot) {
            return Ok(false);
        }
        self.clear_flag(slot);
        Ok(true)
    }

    /// Withdraws the frame pending in `slot`.
    ///
    /// A frame that is already being sent cannot be stopped; it is reported
    /// as [`AbortStatus::Transmitted`]. Either way the buffer is left idle.
    pub fn abort_transmission(&mut self, slot: usize) -> Result<AbortStatus, Error> {
        self.check_tx_slot(slot)?;

        if !matches!(self.code(slot), Some(Code::TxOnce | Code::TxTanswer)) {
            let status = if self.flagged(slot) {
                self.clear_flag(slot);
                AbortStatus::Transmitted
            } else {
                AbortStatus::Idle
            };
            self.set_code(slot, Code::TxInactive);
            return Ok(status);
        }

        self.set_code(slot, Code::TxAbort);
        let timeout = self.hardware_timeout();
        self.wait_for(timeout, |regs| {
            SlotSet(regs.read(offset::IFLAG1)).contains(slot)
        })?;
        let status = match self.code(slot) {
            Some(Code::TxAbort) => AbortStatus::Aborted,
            _ => AbortStatus::Transmitted,
        };
        self.clear_flag(slot);
        self.set_code(slot, Code::TxInactive);
        log::debug!("CAN{} slot {} abort: {:?}", self.instance(), slot, status);
        Ok(status)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{CanConfig, Mode};
    use crate::sim::{FakeClock, FakeDependencies, FakeRegisters};
    use embedded_can::StandardId;
    use fugit::RateExtU32;

    fn frame(id: u16, data: &[u8]) -> Message {
        Message::new_data(StandardId::new(id).unwrap(), data).unwrap()
    }

    macro_rules! setup {
        ($can:ident, $regs:ident, $clock:ident, $mode:expr) => {
            let $regs = FakeRegisters::new();
            let deps = FakeDependencies::new();
            let $clock = FakeClock::new();
            let mut $can = Can::new(0, &$regs, &deps, &$clock).unwrap();
            let mut config = CanConfig::new(500.kHz());
            config.mode = $mode;
            $can.init(&config).unwrap();
        };
    }

    #[test]
    fn oversized_frames_and_foreign_slots_are_rejected() {
        setup!(can, regs, clock, Mode::Normal);
        let mut long = frame(0x100, &[0; 8]);
        long.len = 9;
        assert_eq!(can.send(8, &long), Err(Error::InvalidParam));
        let ok = frame(0x100, &[1]);
        assert_eq!(can.send(7, &ok), Err(Error::InvalidParam));
        assert_eq!(can.send(16, &ok), Err(Error::InvalidParam));
        assert_eq!(can.transmission_completed(40), Err(Error::InvalidParam));
    }

    #[test]
    fn buffer_stays_busy_until_completion_is_observed() {
        setup!(can, regs, clock, Mode::Normal);
        let message = frame(0x123, &[1, 2, 3]);
        can.send(8, &message).unwrap();
        assert_eq!(can.send(8, &message), Err(Error::Busy));
        assert_eq!(can.is_mb_busy(8), Ok(true));
        assert_eq!(can.transmission_completed(8), Ok(false));

        regs.acknowledge(8);
        // Sent, but nobody looked at the completion yet
        assert_eq!(can.is_mb_busy(8), Ok(false));
        assert_eq!(can.send(8, &message), Err(Error::Busy));
        assert_eq!(can.transmission_completed(8), Ok(true));
        assert_eq!(can.send(8, &message), Ok(()));
        assert_eq!(regs.transmitted().as_slice(), &[message, message]);
    }

    #[test]
    fn frame_layout_in_the_buffer() {
        setup!(can, regs, clock, Mode::ListenOnly);
        let message = frame(0x555, &[0xde, 0xad, 0xbe, 0xef]);
        can.send(9, &message).unwrap();
        assert_eq!(regs.peek(offset::mb_id(9)), 0x555 << 18);
        assert_eq!(regs.peek(offset::mb_data(9, 0)), 0xdead_beef);
        assert_eq!(regs.peek(offset::mb_data(9, 1)), 0);
        assert_eq!(regs.peek(offset::mb_cs(9)), 0x0c04_0000);
    }

    #[test]
    fn control_word_is_written_last() {
        setup!(can, regs, clock, Mode::Normal);
        regs.clear_log();
        can.send(10, &frame(0x42, &[7])).unwrap();
        let writes: heapless::Vec<usize, 8> = regs
            .accesses()
            .iter()
            .filter_map(|a| a.write_offset())
            .collect();
        assert_eq!(writes.last(), Some(&offset::mb_cs(10)));
        assert_eq!(writes.len(), 4);
    }

    #[test]
    fn send_blocking_completes_with_an_acknowledging_peer() {
        setup!(can, regs, clock, Mode::Normal);
        regs.set_peer_ack(true);
        let message = frame(0x7ff, &[]);
        can.send_blocking(11, &message, Duration::millis(10)).unwrap();
        // Completion was consumed, the buffer is immediately reusable
        assert_eq!(can.send(11, &message), Ok(()));
    }

    #[test]
    fn send_blocking_times_out_after_a_bounded_number_of_polls() {
        setup!(can, regs, clock, Mode::Normal);
        regs.clear_log();
        let start = clock.elapsed();
        assert_eq!(
            can.send_blocking(12, &frame(1, &[1]), Duration::millis(1)),
            Err(Error::Timeout)
        );
        let polls = regs.read_count(offset::IFLAG1);
        // One IFLAG1 read per clock tick of the 1 ms budget, plus the Busy
        // check in `send`
        assert!((990..=1010).contains(&polls), "{}", polls);
        assert!((clock.elapsed() - start).ticks() <= 1010);
        assert_eq!(can.is_mb_busy(12), Ok(true));
        assert_eq!(can.abort_transmission(12), Ok(AbortStatus::Aborted));
        assert_eq!(can.is_mb_busy(12), Ok(false));
    }

    #[test]
    fn abort_outcomes() {
        setup!(can, regs, clock, Mode::Normal);
        assert_eq!(can.abort_transmission(13), Ok(AbortStatus::Idle));

        can.send(13, &frame(0x10, &[1])).unwrap();
        regs.set_in_arbitration(true);
        assert_eq!(can.abort_transmission(13), Ok(AbortStatus::Transmitted));
        assert_eq!(can.send(13, &frame(0x10, &[1])), Ok(()));

        regs.set_in_arbitration(false);
        assert_eq!(can.abort_transmission(13), Ok(AbortStatus::Aborted));
        assert_eq!(can.code(13), Some(Code::TxInactive));
        assert!(!can.flagged(13));

        // Completed but never observed
        can.send(13, &frame(0x10, &[1])).unwrap();
        regs.acknowledge(13);
        assert_eq!(can.abort_transmission(13), Ok(AbortStatus::Transmitted));
        assert_eq!(can.send(13, &frame(0x10, &[1])), Ok(()));
    }

    #[test]
    fn loopback_completes_immediately() {
        setup!(can, regs, clock, Mode::Loopback);
        can.send(14, &frame(0x321, &[9, 9])).unwrap();
        assert_eq!(can.transmission_completed(14), Ok(true));
        // Loopback never drives the bus
        assert!(regs.transmitted().is_empty());
    }
}
