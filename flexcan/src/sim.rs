//! In-memory model of the controller for host-side testing
//!
//! [`FakeRegisters`] implements [`Registers`] on plain memory and reproduces
//! the controller behaviour the driver depends on: the freeze and soft reset
//! handshakes, registers that only accept writes in freeze mode,
//! write-1-to-clear flags, transmission, acceptance filtering and the RX
//! FIFO. Tests drive the bus side through [`FakeRegisters::inject`] and
//! [`FakeRegisters::acknowledge`], and can make any handshake hang with
//! [`FakeRegisters::stall`].
//!
//! [`FakeDependencies`] and [`FakeClock`] complete the set. The clock
//! advances one microsecond every time it is read, so bounded waits end
//! after a predictable number of polls.

use crate::filter::fifo_entry;
use crate::message::{FrameKind, Message};
use crate::message_buffer::{Code, SlotSet, FIFO_SLOTS, NUM_SLOTS};
use crate::reg::{offset, Cs, Ctrl1, Esr1, Mcr, Registers, ID_MASK};
use crate::rx_buffers::{FIFO_AVAILABLE, FIFO_OVERFLOW, FIFO_WARNING};
use core::cell::{Cell, RefCell};
use flexcan_core::{ClockSource, Dependencies, Duration, Instant, Monotonic};
use fugit::HertzU32;
use heapless::{Deque, HistoryBuffer, Vec};

const WORDS: usize = offset::rximr(NUM_SLOTS) / 4;
const MCR_RESET: u32 = 0xd890_000f;
const FIFO_DEPTH: usize = 6;
const FIFO_WARNING_LEVEL: usize = 5;
const LOG_LEN: usize = 64;
const BUS_LOG_LEN: usize = 32;

/// One register access made through [`Registers`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    /// Read at offset
    Read(usize),
    /// Write of a value at offset
    Write(usize, u32),
}

impl Access {
    /// Offset of a write access
    pub fn write_offset(&self) -> Option<usize> {
        match *self {
            Access::Write(offset, _) => Some(offset),
            Access::Read(_) => None,
        }
    }
}

/// Handshake the model can be told to never complete
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stall {
    /// FRZ_ACK never rises
    FreezeAck,
    /// SOFT_RST never self-clears
    SoftReset,
    /// FRZ_ACK never falls
    FreezeExit,
    /// NOT_RDY never falls
    NotReady,
}

/// Register block of a simulated controller
pub struct FakeRegisters {
    model: RefCell<Model>,
}

struct Model {
    mem: [u32; WORDS],
    stall: Option<Stall>,
    peer_ack: bool,
    in_arbitration: bool,
    /// Transmit buffers waiting for the bus
    pending: SlotSet,
    fifo: Deque<Message, FIFO_DEPTH>,
    bus: Vec<Message, BUS_LOG_LEN>,
    log: HistoryBuffer<Access, LOG_LEN>,
    reads: [u32; WORDS],
    writes: u32,
}

impl Default for FakeRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRegisters {
    /// Controller straight out of reset: disabled, every register cleared
    pub fn new() -> Self {
        let mut model = Model {
            mem: [0; WORDS],
            stall: None,
            peer_ack: false,
            in_arbitration: false,
            pending: SlotSet::default(),
            fifo: Deque::new(),
            bus: Vec::new(),
            log: HistoryBuffer::new(),
            reads: [0; WORDS],
            writes: 0,
        };
        model.set(offset::MCR, MCR_RESET);
        model.update_status();
        Self {
            model: RefCell::new(model),
        }
    }

    /// Register value, without side effects and without being logged
    pub fn peek(&self, offset: usize) -> u32 {
        self.model.borrow().word(offset)
    }

    /// Makes `stall` hang from now on
    pub fn stall(&self, stall: Stall) {
        let mut model = self.model.borrow_mut();
        model.stall = Some(stall);
        model.update_status();
    }

    /// `true` outside of freeze mode and low power mode
    pub fn running(&self) -> bool {
        self.model.borrow().running()
    }

    /// In normal mode, whether another node acknowledges transmitted frames
    /// right away. Otherwise they stay pending until [`Self::acknowledge`].
    pub fn set_peer_ack(&self, ack: bool) {
        self.model.borrow_mut().peer_ack = ack;
    }

    /// Whether pending frames are already on the wire, so an abort request
    /// comes too late
    pub fn set_in_arbitration(&self, in_arbitration: bool) {
        self.model.borrow_mut().in_arbitration = in_arbitration;
    }

    /// Completes the pending transmission of `slot`
    pub fn acknowledge(&self, slot: usize) {
        let mut model = self.model.borrow_mut();
        if model.pending.contains(slot) {
            model.finish_transmission(slot);
        }
    }

    /// Frame arriving from the bus. Returns `false` if no filter accepted it.
    pub fn inject(&self, message: &Message) -> bool {
        self.model.borrow_mut().deliver(message)
    }

    /// Frames put on the bus, oldest first
    pub fn transmitted(&self) -> Vec<Message, BUS_LOG_LEN> {
        self.model.borrow().bus.clone()
    }

    /// Sets the fault confinement field of ESR1
    pub fn set_fault_confinement(&self, state: u8) {
        let mut model = self.model.borrow_mut();
        let esr1 = (model.word(offset::ESR1) & !Esr1::FLTCONF) | ((u32::from(state) << 4) & Esr1::FLTCONF);
        model.set(offset::ESR1, esr1);
    }

    /// Raises the ESR1 interrupt flags in `flags`
    pub fn raise_error(&self, flags: u32) {
        let mut model = self.model.borrow_mut();
        let esr1 = model.word(offset::ESR1) | (flags & Esr1::INTERRUPTS);
        model.set(offset::ESR1, esr1);
    }

    /// Sets the error counters
    pub fn set_error_counters(&self, tx: u8, rx: u8) {
        self.model
            .borrow_mut()
            .set(offset::ECR, (u32::from(rx) << 8) | u32::from(tx));
    }

    /// Forgets every access recorded so far
    pub fn clear_log(&self) {
        let mut model = self.model.borrow_mut();
        model.log = HistoryBuffer::new();
        model.reads = [0; WORDS];
        model.writes = 0;
    }

    /// The most recent accesses, oldest first
    pub fn accesses(&self) -> Vec<Access, LOG_LEN> {
        self.model.borrow().log.oldest_ordered().copied().collect()
    }

    /// Number of reads of the register at `offset`
    pub fn read_count(&self, offset: usize) -> u32 {
        self.model
            .borrow()
            .reads
            .get(offset / 4)
            .copied()
            .unwrap_or(0)
    }

    /// Number of writes to any register
    pub fn writes(&self) -> u32 {
        self.model.borrow().writes
    }
}

impl Registers for FakeRegisters {
    fn read(&self, offset: usize) -> u32 {
        let mut model = self.model.borrow_mut();
        model.log.write(Access::Read(offset));
        if let Some(count) = model.reads.get_mut(offset / 4) {
            *count += 1;
        }
        model.read(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        let mut model = self.model.borrow_mut();
        model.log.write(Access::Write(offset, value));
        model.writes += 1;
        model.write(offset, value);
    }
}

fn bit(index: usize) -> u32 {
    SlotSet::single(index).0
}

fn control_word_slot(offset: usize) -> Option<usize> {
    let relative = offset.checked_sub(offset::MB_BASE)?;
    let slot = relative / offset::MB_SIZE;
    (relative % offset::MB_SIZE == 0 && slot < NUM_SLOTS).then_some(slot)
}

impl Model {
    fn word(&self, offset: usize) -> u32 {
        self.mem.get(offset / 4).copied().unwrap_or(0)
    }

    fn set(&mut self, offset: usize, value: u32) {
        if let Some(word) = self.mem.get_mut(offset / 4) {
            *word = value;
        }
    }

    fn mcr(&self) -> Mcr {
        self.word(offset::MCR).into()
    }

    fn frozen(&self) -> bool {
        self.mcr().frz_ack()
    }

    fn running(&self) -> bool {
        self.word(offset::MCR) & (Mcr::MDIS | Mcr::FRZ_ACK | Mcr::NOT_RDY) == 0
    }

    fn flag(&mut self, index: usize) {
        let iflag = self.word(offset::IFLAG1) | bit(index);
        self.set(offset::IFLAG1, iflag);
    }

    fn read(&mut self, offset: usize) -> u32 {
        let value = self.word(offset);
        if offset == offset::TIMER {
            self.set(offset, (value + 1) & 0xffff);
        }
        value
    }

    fn write(&mut self, offset: usize, value: u32) {
        match offset {
            offset::MCR => self.write_mcr(value),
            offset::CTRL1 => {
                let mut writable = Ctrl1::BOFFMSK | Ctrl1::ERRMSK;
                if self.frozen() {
                    writable |= Ctrl1::FREEZE_ONLY;
                }
                if self.mcr().mdis() {
                    writable |= Ctrl1::CLKSRC;
                }
                let value = (self.word(offset) & !writable) | (value & writable);
                self.set(offset, value);
            }
            offset::IFLAG1 => self.clear_flags(value),
            offset::ESR1 => {
                let esr1 = self.word(offset) & !(value & Esr1::INTERRUPTS);
                self.set(offset, esr1);
            }
            _ if self.freeze_only(offset) => {
                if self.frozen() {
                    self.set(offset, value);
                }
            }
            _ => {
                self.set(offset, value);
                if let Some(slot) = control_word_slot(offset) {
                    self.control_written(slot);
                }
            }
        }
    }

    fn freeze_only(&self, offset: usize) -> bool {
        let masks = [
            offset::RXMGMASK,
            offset::RX14MASK,
            offset::RX15MASK,
            offset::RXFGMASK,
            offset::CTRL2,
        ];
        let fifo_table = offset::fifo_table(0)..offset::fifo_table(FIFO_SLOTS.end);
        masks.contains(&offset)
            || (offset::RXIMR_BASE..offset::rximr(NUM_SLOTS)).contains(&offset)
            || (self.mcr().rfen() && fifo_table.contains(&offset))
    }

    fn write_mcr(&mut self, value: u32) {
        let mut writable = Mcr::MDIS | Mcr::FRZ | Mcr::HALT | Mcr::SOFT_RST;
        if self.frozen() {
            writable |= Mcr::RFEN | Mcr::SUPV | Mcr::SRX_DIS | Mcr::IRMQ | Mcr::AEN | Mcr::MAXMB;
        }
        let mcr = (self.word(offset::MCR) & !writable) | (value & writable);
        self.set(offset::MCR, mcr);
        if mcr & Mcr::SOFT_RST != 0 && self.stall != Some(Stall::SoftReset) {
            self.soft_reset();
        }
        self.update_status();
    }

    fn soft_reset(&mut self) {
        let mcr = (MCR_RESET & !Mcr::MDIS) | (self.word(offset::MCR) & (Mcr::MDIS | Mcr::FRZ_ACK));
        self.set(offset::MCR, mcr);
        for register in [
            offset::IMASK1,
            offset::IFLAG1,
            offset::ESR1,
            offset::ECR,
            offset::TIMER,
            offset::CTRL2,
        ] {
            self.set(register, 0);
        }
        self.fifo.clear();
        self.pending = SlotSet::default();
    }

    /// Recomputes the acknowledge bits of MCR from the request bits
    fn update_status(&mut self) {
        let mcr = self.word(offset::MCR);
        let was_frozen = mcr & Mcr::FRZ_ACK != 0;
        let disabled = mcr & Mcr::MDIS != 0;
        let requested = mcr & Mcr::FRZ != 0 && mcr & Mcr::HALT != 0;
        let frozen = if disabled {
            false
        } else if requested {
            was_frozen || self.stall != Some(Stall::FreezeAck)
        } else {
            was_frozen && self.stall == Some(Stall::FreezeExit)
        };
        let not_ready = disabled || frozen || self.stall == Some(Stall::NotReady);

        let mut status = 0;
        if disabled {
            status |= Mcr::LPM_ACK;
        }
        if frozen {
            status |= Mcr::FRZ_ACK;
        }
        if not_ready {
            status |= Mcr::NOT_RDY;
        }
        let mcr = (mcr & !(Mcr::LPM_ACK | Mcr::FRZ_ACK | Mcr::NOT_RDY)) | status;
        self.set(offset::MCR, mcr);
    }

    fn clear_flags(&mut self, value: u32) {
        let iflag = self.word(offset::IFLAG1) & !value;
        self.set(offset::IFLAG1, iflag);
        if self.mcr().rfen() && value & bit(FIFO_AVAILABLE) != 0 {
            self.fifo.pop_front();
            self.present_fifo();
        }
    }

    fn control_written(&mut self, slot: usize) {
        if self.mcr().rfen() && FIFO_SLOTS.contains(&slot) {
            return;
        }
        let cs = Cs::from(self.word(offset::mb_cs(slot)));
        match Code::from_raw(cs.code()) {
            Some(Code::TxOnce) if self.running() => self.start_transmission(slot),
            Some(Code::TxAbort) => self.abort(slot),
            _ => self.pending.0 &= !bit(slot),
        }
    }

    fn self_reception(&self) -> bool {
        !self.mcr().srx_dis()
    }

    fn start_transmission(&mut self, slot: usize) {
        let ctrl1 = Ctrl1::from(self.word(offset::CTRL1));
        if ctrl1.lpb() {
            let message = self.message(slot);
            if self.self_reception() {
                self.deliver(&message);
            }
            self.complete(slot);
            return;
        }
        self.pending.0 |= bit(slot);
        if ctrl1.lom() {
            // Listen-only never drives the bus
            return;
        }
        let message = self.message(slot);
        // Frames beyond the log capacity are still transmitted
        let _ = self.bus.push(message);
        if self.peer_ack {
            self.finish_transmission(slot);
        }
    }

    fn finish_transmission(&mut self, slot: usize) {
        if self.self_reception() {
            let message = self.message(slot);
            self.deliver(&message);
        }
        self.complete(slot);
    }

    fn complete(&mut self, slot: usize) {
        let mut cs = Cs::from(self.word(offset::mb_cs(slot)));
        cs.set_code(Code::TxInactive.into());
        self.set(offset::mb_cs(slot), cs.bits());
        self.pending.0 &= !bit(slot);
        self.flag(slot);
    }

    fn abort(&mut self, slot: usize) {
        if !self.pending.contains(slot) {
            return;
        }
        if self.in_arbitration {
            self.finish_transmission(slot);
        } else {
            self.pending.0 &= !bit(slot);
            self.flag(slot);
        }
    }

    fn message(&self, slot: usize) -> Message {
        Message::decode(
            self.word(offset::mb_cs(slot)).into(),
            self.word(offset::mb_id(slot)),
            [
                self.word(offset::mb_data(slot, 0)),
                self.word(offset::mb_data(slot, 1)),
            ],
        )
    }

    fn store(&mut self, slot: usize, message: &Message, code: Code) {
        let timestamp = self.word(offset::TIMER) & 0xffff;
        let [word0, word1] = message.data_words();
        self.set(offset::mb_cs(slot), message.control_word(code).bits() | timestamp);
        self.set(offset::mb_id(slot), message.id_word());
        self.set(offset::mb_data(slot, 0), word0);
        self.set(offset::mb_data(slot, 1), word1);
    }

    fn deliver(&mut self, message: &Message) -> bool {
        if !self.running() {
            return false;
        }
        let mcr = self.mcr();
        if mcr.rfen() && self.fifo_accepts(message) {
            return self.push_fifo(message);
        }

        let first = if mcr.rfen() { FIFO_SLOTS.end } else { 0 };
        let free = (first..NUM_SLOTS).find(|&slot| {
            let cs = Cs::from(self.word(offset::mb_cs(slot)));
            self.mailbox_accepts(slot, message)
                && (Code::from_raw(cs.code()) == Some(Code::RxEmpty)
                    || self.word(offset::IFLAG1) & bit(slot) == 0)
        });
        let target = match free {
            Some(slot) => Some((slot, Code::RxFull)),
            None => (first..NUM_SLOTS)
                .filter(|&slot| self.mailbox_accepts(slot, message))
                .last()
                .map(|slot| (slot, Code::RxOverrun)),
        };
        match target {
            Some((slot, code)) => {
                self.store(slot, message, code);
                self.flag(slot);
                true
            }
            None => false,
        }
    }

    fn mailbox_accepts(&self, slot: usize, message: &Message) -> bool {
        let cs = Cs::from(self.word(offset::mb_cs(slot)));
        let receiving = matches!(
            Code::from_raw(cs.code()),
            Some(Code::RxEmpty | Code::RxFull | Code::RxOverrun)
        );
        let mask = if self.mcr().irmq() {
            self.word(offset::rximr(slot))
        } else {
            self.word(offset::RXMGMASK)
        };
        receiving
            && cs.ide() == message.is_extended()
            && (message.id_word() ^ self.word(offset::mb_id(slot))) & mask & ID_MASK == 0
    }

    fn fifo_accepts(&self, message: &Message) -> bool {
        let entry = fifo_entry(message.id, message.kind == FrameKind::Remote);
        FIFO_SLOTS.into_iter().any(|index| {
            let mask = if self.mcr().irmq() {
                self.word(offset::rximr(index))
            } else {
                self.word(offset::RXFGMASK)
            };
            (entry ^ self.word(offset::fifo_table(index))) & mask == 0
        })
    }

    fn push_fifo(&mut self, message: &Message) -> bool {
        let was_empty = self.fifo.is_empty();
        if self.fifo.push_back(*message).is_err() {
            self.flag(FIFO_OVERFLOW);
            return false;
        }
        if self.fifo.len() == FIFO_WARNING_LEVEL {
            self.flag(FIFO_WARNING);
        }
        if was_empty {
            self.present_fifo();
        }
        true
    }

    /// Shows the oldest FIFO entry in message buffer 0
    fn present_fifo(&mut self) {
        if let Some(message) = self.fifo.front().copied() {
            self.store(0, &message, Code::RxFull);
            self.flag(FIFO_AVAILABLE);
        }
    }
}

/// Clock gate of a simulated controller
pub struct FakeDependencies {
    enabled: Cell<Option<ClockSource>>,
    frequency: HertzU32,
}

impl Default for FakeDependencies {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDependencies {
    /// Every clock source runs at 40 MHz
    pub fn new() -> Self {
        Self::with_frequency(HertzU32::MHz(40))
    }

    /// Every clock source runs at `frequency`
    pub fn with_frequency(frequency: HertzU32) -> Self {
        Self {
            enabled: Cell::new(None),
            frequency,
        }
    }

    /// Clock source currently ungated, if any
    pub fn enabled(&self) -> Option<ClockSource> {
        self.enabled.get()
    }
}

unsafe impl Dependencies for &FakeDependencies {
    fn enable_clock(&mut self, source: ClockSource) {
        self.enabled.set(Some(source));
    }

    fn disable_clock(&mut self) {
        self.enabled.set(None);
    }

    fn clock_frequency(&self, _: ClockSource) -> HertzU32 {
        self.frequency
    }
}

/// Monotonic clock advancing one tick each time it is read
#[derive(Default)]
pub struct FakeClock {
    ticks: Cell<u64>,
}

impl FakeClock {
    /// Clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Time since creation
    pub fn elapsed(&self) -> Duration {
        Duration::from_ticks(self.ticks.get())
    }

    /// Moves the clock forward by `by`
    pub fn advance(&self, by: Duration) {
        self.ticks.set(self.ticks.get() + by.ticks());
    }
}

impl Monotonic for &FakeClock {
    fn now(&mut self) -> Instant {
        let now = self.ticks.get();
        self.ticks.set(now + 1);
        Instant::from_ticks(now)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use embedded_can::StandardId;

    fn freeze(regs: &FakeRegisters) {
        regs.write(offset::MCR, Mcr::FRZ | Mcr::HALT);
    }

    #[test]
    fn leaves_reset_disabled() {
        let regs = FakeRegisters::new();
        let mcr = Mcr::from(regs.peek(offset::MCR));
        assert!(mcr.mdis() && mcr.lpm_ack() && mcr.not_rdy());
        assert!(!mcr.frz_ack());
        assert!(!regs.running());
    }

    #[test]
    fn freeze_handshake() {
        let regs = FakeRegisters::new();
        freeze(&regs);
        let mcr = Mcr::from(regs.peek(offset::MCR));
        assert!(mcr.frz_ack() && mcr.not_rdy() && !mcr.lpm_ack());

        regs.write(offset::MCR, 0);
        assert!(regs.running());
    }

    #[test]
    fn stalled_freeze_exit_keeps_acknowledge() {
        let regs = FakeRegisters::new();
        freeze(&regs);
        regs.stall(Stall::FreezeExit);
        regs.write(offset::MCR, 0);
        assert!(Mcr::from(regs.peek(offset::MCR)).frz_ack());
    }

    #[test]
    fn soft_reset_clears_interrupt_state() {
        let regs = FakeRegisters::new();
        freeze(&regs);
        regs.write(offset::IMASK1, 0xff00);
        regs.set_error_counters(1, 2);
        regs.raise_error(Esr1::ERR_INT);
        regs.write(offset::MCR, Mcr::FRZ | Mcr::HALT | Mcr::SOFT_RST);
        let mcr = Mcr::from(regs.peek(offset::MCR));
        assert!(!mcr.soft_rst());
        assert!(mcr.frz_ack());
        assert_eq!(regs.peek(offset::IMASK1), 0);
        assert_eq!(regs.peek(offset::ECR), 0);
        assert_eq!(regs.peek(offset::ESR1), 0);
    }

    #[test]
    fn timing_bits_only_change_in_freeze_mode() {
        let regs = FakeRegisters::new();
        regs.write(offset::MCR, 0);
        regs.write(offset::CTRL1, 0x0400_0000 | Ctrl1::ERRMSK);
        assert_eq!(regs.peek(offset::CTRL1), Ctrl1::ERRMSK);
        freeze(&regs);
        regs.write(offset::CTRL1, 0x0400_0000);
        assert_eq!(regs.peek(offset::CTRL1), 0x0400_0000);
        regs.write(offset::RXMGMASK, 0x55);
        assert_eq!(regs.peek(offset::RXMGMASK), 0x55);
    }

    #[test]
    fn clock_source_only_changes_in_disable_mode() {
        let regs = FakeRegisters::new();
        regs.write(offset::CTRL1, Ctrl1::CLKSRC);
        assert_eq!(regs.peek(offset::CTRL1), Ctrl1::CLKSRC);
        freeze(&regs);
        regs.write(offset::CTRL1, 0);
        assert_eq!(regs.peek(offset::CTRL1), Ctrl1::CLKSRC);
    }

    #[test]
    fn flags_are_write_one_to_clear() {
        let regs = FakeRegisters::new();
        regs.model.borrow_mut().set(offset::IFLAG1, 0b1011);
        regs.write(offset::IFLAG1, 0b0010);
        assert_eq!(regs.peek(offset::IFLAG1), 0b1001);
    }

    #[test]
    fn timer_advances_when_read() {
        let regs = FakeRegisters::new();
        assert_eq!(regs.read(offset::TIMER), 0);
        assert_eq!(regs.read(offset::TIMER), 1);
        assert_eq!(regs.read_count(offset::TIMER), 2);
    }

    #[test]
    fn nothing_is_received_while_frozen() {
        let regs = FakeRegisters::new();
        freeze(&regs);
        let message = Message::new_data(StandardId::new(1).unwrap(), &[]).unwrap();
        assert!(!regs.inject(&message));
    }

    #[test]
    fn clock_ticks_on_every_read() {
        let clock = FakeClock::new();
        let mut monotonic = &clock;
        assert_eq!(monotonic.now().ticks(), 0);
        assert_eq!(monotonic.now().ticks(), 1);
        clock.advance(Duration::millis(1));
        assert_eq!(clock.elapsed(), Duration::micros(1002));
    }
}
