#![no_std]
#![warn(missing_docs)]
//! # FlexCAN
//!
//! ## Overview
//! This crate provides a platform-agnostic driver for the FlexCAN CAN
//! controller found in many NXP microcontrollers.
//!
//! It provides the following features:
//!
//! - classic CAN 2.0A/B frames with 11 and 29-bit identifiers
//! - bit timing derived from the controller clock and the requested bitrate
//! - initialization through freeze mode with bounded waits on every hardware
//!   handshake
//! - transmission through 8 dedicated message buffers, including blocking
//!   sends and abort
//! - reception through 16 message buffers with individual acceptance
//!   filters, and optionally through the 6-deep RX FIFO
//! - interrupt handling split into an acknowledging half for the ISR and a
//!   dispatching half calling per-buffer handlers
//! - fault confinement state and error counters
//! - [`embedded_can::nb::Can`] implementation
//!
//! ## Integration
//!
//! The driver reaches the hardware through three seams, all provided by the
//! target HAL:
//! - a [`Registers`] implementation, normally [`Mmio`] over the address
//!   given by a [`CanId`] marker type
//! - [`Dependencies`] ungating the controller clock and reporting its
//!   frequency
//! - a [`Monotonic`] clock bounding every wait on the hardware
//!
//! With the `fake` feature, [`sim`] provides in-memory versions of all three
//! for host-side testing.
//!
//! ## Message buffers
//!
//! The 32 message buffers are split in fixed ranges:
//! [`FIFO_SLOTS`] (0-7) belong to the RX FIFO when it is enabled,
//! [`TX_SLOTS`] (8-15) transmit and [`RX_SLOTS`] (16-31) receive.
//!
//! ## Bus off
//!
//! The driver does not recover from bus off on its own. Once
//! [`Can::state`] reports [`State::BusOff`], call [`Can::deinit`] and
//! [`Can::init`].
//!
//! ## Usage example
//!
//! ```no_run
//! use flexcan::bus::Can;
//! use flexcan::config::{CanConfig, Mode};
//! use flexcan::core::fugit::HertzU32;
//! use flexcan::core::Duration;
//! use flexcan::embedded_can::StandardId;
//! use flexcan::filter::Filter;
//! use flexcan::message::Message;
//! use flexcan::reg::Mmio;
//! # pub enum Can1 {}
//! # unsafe impl flexcan::core::CanId for Can1 {
//! #     const ADDRESS: *const () = 0x401D_0000 as *const _;
//! # }
//! # pub struct Dependencies;
//! # unsafe impl flexcan::core::Dependencies for Dependencies {
//! #     fn enable_clock(&mut self, _: flexcan::core::ClockSource) {}
//! #     fn disable_clock(&mut self) {}
//! #     fn clock_frequency(&self, _: flexcan::core::ClockSource) -> HertzU32 {
//! #         HertzU32::MHz(40)
//! #     }
//! # }
//! # pub struct Timer;
//! # impl flexcan::core::Monotonic for Timer {
//! #     fn now(&mut self) -> flexcan::core::Instant {
//! #         unimplemented!()
//! #     }
//! # }
//! # fn main() -> Result<(), flexcan::Error> {
//!
//! let regs = unsafe { Mmio::<Can1>::new() };
//! let mut can = Can::new(0, regs, Dependencies, Timer)?;
//!
//! let mut config = CanConfig::new(HertzU32::kHz(500));
//! config.mode = Mode::Loopback;
//! config.self_reception = true;
//! can.init(&config)?;
//!
//! let id = StandardId::new(0x555).unwrap();
//! can.configure_rx_filter(16, &Filter::exact(id))?;
//!
//! let message = Message::new_data(id, &[0xde, 0xad, 0xbe, 0xef]).unwrap();
//! can.send(8, &message)?;
//! let received = can.receive_blocking(16, Duration::millis(1000))?;
//! assert_eq!(received, message);
//! # Ok(())
//! # }
//! ```
//!
//! [`Registers`]: crate::reg::Registers
//! [`Mmio`]: crate::reg::Mmio
//! [`CanId`]: flexcan_core::CanId
//! [`Dependencies`]: flexcan_core::Dependencies
//! [`Monotonic`]: flexcan_core::Monotonic
//! [`FIFO_SLOTS`]: crate::message_buffer::FIFO_SLOTS
//! [`TX_SLOTS`]: crate::message_buffer::TX_SLOTS
//! [`RX_SLOTS`]: crate::message_buffer::RX_SLOTS
//! [`Can::state`]: crate::bus::Can::state
//! [`Can::deinit`]: crate::bus::Can::deinit
//! [`Can::init`]: crate::bus::Can::init
//! [`State::BusOff`]: crate::bus::State::BusOff

pub mod bus;
pub mod config;
mod error;
pub mod filter;
pub mod interrupt;
pub mod message;
pub mod message_buffer;
pub mod prelude;
pub mod reg;
pub mod rx_buffers;
#[cfg(any(test, feature = "fake"))]
pub mod sim;
pub mod tx_buffers;

pub use embedded_can;
pub use error::Error;
pub use flexcan_core as core;
