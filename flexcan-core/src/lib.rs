#![no_std]
#![warn(missing_docs)]

//! `flexcan-core` provides a set of essential abstractions that serve as a
//! thin integration layer between the platform independent [`flexcan`] crate
//! and platform specific HAL crates (in documentation also referred to as
//! _target HALs_).
//!
//! Traits from this crate are not supposed to be implemented by the
//! application developer; implementations should be provided by target HALs.
//!
//! Integrators of this crate into any given target HAL are responsible for
//! soundness of trait implementations and conforming to their respective safety
//! prerequisites.
//!
//! [`flexcan`]: <https://docs.rs/crate/flexcan/>

pub use fugit;

/// Point in time as seen by a [`Monotonic`] clock, in microseconds.
pub type Instant = fugit::TimerInstantU64<1_000_000>;

/// Span of time measured by a [`Monotonic`] clock, in microseconds.
pub type Duration = fugit::MicrosDurationU64;

/// Trait representing CAN peripheral identity
///
/// Types implementing this trait are expected to be used as marker types that
/// identify a specific instance of the CAN controller available on the
/// platform (as there might be more than one). It only conveys *where* the
/// register block is located, not that it can be accessed. The latter is
/// expressed by owning the [`Dependencies`] of the controller.
///
/// # Safety
/// `CanId::ADDRESS` points to the start of a valid FlexCAN register block
///
/// # Examples
/// ```no_run
/// use flexcan_core::CanId;
///
/// pub enum Can1 {}
///
/// unsafe impl CanId for Can1 {
///     const ADDRESS: *const () = 0x401D_0000 as *const _;
/// }
///
/// pub enum Can2 {}
///
/// unsafe impl CanId for Can2 {
///     const ADDRESS: *const () = 0x401D_4000 as *const _;
/// }
/// ```
pub unsafe trait CanId {
    /// Static address of the register block controlling the CAN controller
    const ADDRESS: *const ();
}

/// Clock feeding the protocol engine of the controller.
///
/// Which physical clock sits behind each variant is a property of the target
/// platform; the target HAL maps them in its [`Dependencies`]
/// implementation.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockSource {
    /// Crystal oscillator
    #[default]
    Oscillator,
    /// Peripheral bus clock
    PeripheralBus,
    /// Clock derived from the system PLL
    SystemPll,
    /// Externally supplied clock
    External,
}

impl ClockSource {
    /// `true` if the controller's clock-source select bit has to point at the
    /// peripheral clock for this source.
    pub fn selects_peripheral_clock(self) -> bool {
        !matches!(self, ClockSource::Oscillator)
    }
}

/// Trait representing CAN peripheral dependencies
///
/// Structs implementing [`Dependencies`] should
/// - enclose all object representable dependencies of the controller (clock
///   gate, pins) and release them upon destruction
/// - be constructible only once the clock tree has stabilised every
///   [`ClockSource`] they report a frequency for
/// - be a singleton per controller instance
///
/// The driver trusts the reported nominal frequencies; it never measures
/// them.
///
/// # Safety
/// While a [`Dependencies`] instance exists
/// - CAN related clocks must not change
/// - CAN related pin modes must not change
/// - the register block must not be accessible by other parts of the target
///   HAL
pub unsafe trait Dependencies {
    /// Ungate the controller clock, routing `source` to the protocol engine.
    fn enable_clock(&mut self, source: ClockSource);
    /// Gate the controller clock off.
    fn disable_clock(&mut self);
    /// Nominal frequency of `source`.
    fn clock_frequency(&self, source: ClockSource) -> fugit::HertzU32;
}

/// Free-running clock used to bound every wait on the hardware.
///
/// The clock must never go backwards. Resolution is microseconds; coarser
/// clocks are fine as long as they keep advancing while the driver spins.
pub trait Monotonic {
    /// Current time.
    fn now(&mut self) -> Instant;
}

impl<T: Monotonic + ?Sized> Monotonic for &mut T {
    fn now(&mut self) -> Instant {
        (**self).now()
    }
}
