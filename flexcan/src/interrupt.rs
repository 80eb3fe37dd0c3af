//! Interrupt handling
//!
//! Handling is split in two halves. [`Can::on_interrupt`] runs in the
//! interrupt service routine of the controller: it acknowledges the hardware
//! and turns every flagged source into an [`Event`] in a bounded queue.
//! [`Can::dispatch`] runs wherever the application wants the handlers to run
//! (the ISR itself, a software task, the main loop) and calls the handler
//! registered for each event.
//!
//! Receive buffers are masked between the two halves, so each frame produces
//! one event and the handler decides when to call [`Can::receive`].

use crate::bus::{Can, FaultState};
use crate::message_buffer::{SlotSet, NUM_SLOTS, RX_SLOTS, TX_SLOTS};
use crate::reg::{offset, Ctrl1, Esr1, Registers};
use crate::Error;
use flexcan_core::{Dependencies, Monotonic};

/// Size of the event queue; one slot is kept free by the queue, so
/// `EVENT_QUEUE_LEN - 1` events can be pending.
pub const EVENT_QUEUE_LEN: usize = 64;

/// Handler for a transmit or receive buffer, called with the buffer index
/// and the context given at installation.
pub type SlotHandler<R, D, T> = fn(&mut Can<R, D, T>, usize, usize);

/// Handler for error and bus-off interrupts, called with the error details
/// and the context given at installation.
pub type ErrorHandler<R, D, T> = fn(&mut Can<R, D, T>, ErrorEvent, usize);

/// Details of an error interrupt
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    /// Fault confinement state when the interrupt was taken
    pub fault: FaultState,
    /// Error and status flags when the interrupt was taken
    pub flags: Esr1,
}

impl ErrorEvent {
    /// `true` if the controller went bus off
    pub fn bus_off(&self) -> bool {
        self.flags.boff_int()
    }

    /// `true` if the controller finished bus-off recovery
    pub fn bus_off_done(&self) -> bool {
        self.flags.boff_done_int()
    }
}

/// Work queued by [`Can::on_interrupt`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    /// Transmit buffer finished sending
    Transmitted(usize),
    /// Receive buffer holds a frame
    Received(usize),
    /// Error or bus-off interrupt
    Error(ErrorEvent),
}

pub(crate) struct Handlers<R, D, T> {
    pub(crate) tx: [Option<(SlotHandler<R, D, T>, usize)>; NUM_SLOTS],
    pub(crate) rx: [Option<(SlotHandler<R, D, T>, usize)>; NUM_SLOTS],
    pub(crate) error: Option<(ErrorHandler<R, D, T>, usize)>,
}

impl<R, D, T> Handlers<R, D, T> {
    pub(crate) fn new() -> Self {
        Self {
            tx: [None; NUM_SLOTS],
            rx: [None; NUM_SLOTS],
            error: None,
        }
    }

    /// Buffers whose interrupt should be enabled
    fn slots(&self) -> SlotSet {
        (0..NUM_SLOTS)
            .filter(|&slot| self.tx[slot].is_some() || self.rx[slot].is_some())
            .collect()
    }
}

impl<R: Registers, D: Dependencies, T: Monotonic> Can<R, D, T> {
    /// Registers `handler` for transmit buffer `slot`, or removes the current
    /// one with `None`. The buffer interrupt is enabled while a handler is
    /// installed.
    ///
    /// Handlers may be installed before [`Can::init`]; the interrupt is then
    /// enabled during initialization.
    pub fn install_tx_handler(
        &mut self,
        slot: usize,
        handler: Option<SlotHandler<R, D, T>>,
        context: usize,
    ) -> Result<(), Error> {
        if !TX_SLOTS.contains(&slot) {
            return Err(Error::InvalidParam);
        }
        self.handlers.tx[slot] = handler.map(|h| (h, context));
        self.set_slot_interrupt(slot, handler.is_some());
        Ok(())
    }

    /// Registers `handler` for receive buffer `slot`, or removes the current
    /// one with `None`. See [`Self::install_tx_handler`].
    pub fn install_rx_handler(
        &mut self,
        slot: usize,
        handler: Option<SlotHandler<R, D, T>>,
        context: usize,
    ) -> Result<(), Error> {
        if !RX_SLOTS.contains(&slot) {
            return Err(Error::InvalidParam);
        }
        self.handlers.rx[slot] = handler.map(|h| (h, context));
        self.set_slot_interrupt(slot, handler.is_some());
        Ok(())
    }

    /// Registers the handler for error and bus-off interrupts, or removes it
    /// with `None`.
    pub fn install_error_handler(
        &mut self,
        handler: Option<ErrorHandler<R, D, T>>,
        context: usize,
    ) -> Result<(), Error> {
        self.handlers.error = handler.map(|h| (h, context));
        if self.ensure_initialized().is_ok() {
            let masks = Ctrl1::ERRMSK | Ctrl1::BOFFMSK;
            self.regs.modify(offset::CTRL1, |ctrl1| {
                if handler.is_some() {
                    ctrl1 | masks
                } else {
                    ctrl1 & !masks
                }
            });
        }
        Ok(())
    }

    /// Acknowledges pending interrupts and queues an [`Event`] for each.
    /// Call from the interrupt service routine of the controller.
    ///
    /// Transmit completions are acknowledged right away. Receive buffers are
    /// masked until their event has been dispatched; the frame stays in the
    /// buffer. If the queue is full the event is dropped.
    pub fn on_interrupt(&mut self) {
        if self.ensure_initialized().is_err() {
            return;
        }

        let raised = SlotSet(self.regs.read(offset::IFLAG1) & self.regs.read(offset::IMASK1));
        for slot in raised.iter() {
            if TX_SLOTS.contains(&slot) {
                self.clear_flag(slot);
                self.queue(Event::Transmitted(slot));
            } else if RX_SLOTS.contains(&slot) {
                self.set_slot_interrupt(slot, false);
                self.queue(Event::Received(slot));
            }
        }

        let esr1 = Esr1::from(self.regs.read(offset::ESR1));
        let errors = esr1.bits() & Esr1::INTERRUPTS;
        if errors != 0 && self.handlers.error.is_some() {
            self.regs.write(offset::ESR1, errors);
            self.queue(Event::Error(ErrorEvent {
                fault: esr1.into(),
                flags: esr1,
            }));
        }
    }

    /// Calls the handler of every queued event, oldest first. Returns the
    /// number of handlers called.
    ///
    /// Events whose handler was removed in the meantime are discarded.
    /// Receive buffers are unmasked again once their handler has run.
    pub fn dispatch(&mut self) -> usize {
        let mut called = 0;
        while let Some(event) = self.events.dequeue() {
            match event {
                Event::Transmitted(slot) => {
                    if let Some((handler, context)) = self.handlers.tx[slot] {
                        handler(self, slot, context);
                        called += 1;
                    }
                }
                Event::Received(slot) => {
                    if let Some((handler, context)) = self.handlers.rx[slot] {
                        handler(self, slot, context);
                        called += 1;
                    }
                    if self.handlers.rx[slot].is_some() {
                        self.set_slot_interrupt(slot, true);
                    }
                }
                Event::Error(error) => {
                    if let Some((handler, context)) = self.handlers.error {
                        handler(self, error, context);
                        called += 1;
                    }
                }
            }
        }
        // Buffers whose event was dropped on a full queue fire again
        if self.ensure_initialized().is_ok() {
            self.restore_interrupt_masks();
        }
        called
    }

    /// Number of events waiting for [`Self::dispatch`]
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Enables the interrupt of every buffer with an installed handler.
    pub(crate) fn restore_interrupt_masks(&self) {
        self.regs.write(offset::IMASK1, self.handlers.slots().0);
    }

    fn set_slot_interrupt(&self, slot: usize, enabled: bool) {
        // The register block is not clocked before init
        if self.ensure_initialized().is_err() {
            return;
        }
        let bit = SlotSet::single(slot).0;
        self.regs.modify(offset::IMASK1, |imask| {
            if enabled {
                imask | bit
            } else {
                imask & !bit
            }
        });
    }

    fn queue(&mut self, event: Event) {
        if self.events.enqueue(event).is_err() {
            log::warn!("CAN{} event queue full, dropped {:?}", self.instance(), event);
        }
    }
}
