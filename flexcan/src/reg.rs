//! Register access for the FlexCAN register block
//!
//! The driver never dereferences the register block directly. Every access
//! goes through [`Registers`], which is implemented by [`Mmio`] for real
//! hardware and by [`crate::sim::FakeRegisters`] for host-side tests.

use bitfield::bitfield;
use core::marker::PhantomData;
use flexcan_core::CanId;
use vcell::VolatileCell;

/// Word-granular access to a FlexCAN register block.
///
/// Offsets are byte offsets from the start of the block and always 4-byte
/// aligned. Reads may have side effects on hardware (reading a message
/// buffer control word locks it, reading the timer unlocks it), so the
/// driver is careful about the order and count of reads.
pub trait Registers {
    /// Read the register at `offset`.
    fn read(&self, offset: usize) -> u32;
    /// Write `value` to the register at `offset`.
    fn write(&self, offset: usize, value: u32);

    /// Read-modify-write of the register at `offset`.
    fn modify<F: FnOnce(u32) -> u32>(&self, offset: usize, f: F)
    where
        Self: Sized,
    {
        let value = self.read(offset);
        self.write(offset, f(value));
    }
}

impl<R: Registers + ?Sized> Registers for &R {
    fn read(&self, offset: usize) -> u32 {
        (**self).read(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }
}

/// Memory mapped register block of the controller identified by `Id`.
pub struct Mmio<Id> {
    _id: PhantomData<Id>,
}

impl<Id: CanId> Mmio<Id> {
    /// # Safety
    /// The caller must own the controller referenced by `Id` (usually proven
    /// by owning its [`Dependencies`](flexcan_core::Dependencies)). Do not
    /// keep multiple instances for the same controller.
    pub unsafe fn new() -> Self {
        Self { _id: PhantomData }
    }

    fn cell(&self, offset: usize) -> &VolatileCell<u32> {
        // Safety: `Id::ADDRESS` points to a valid register block and every
        // offset used by the driver lies within it.
        unsafe {
            &*(Id::ADDRESS as *const u8)
                .add(offset)
                .cast::<VolatileCell<u32>>()
        }
    }
}

impl<Id: CanId> Registers for Mmio<Id> {
    fn read(&self, offset: usize) -> u32 {
        self.cell(offset).get()
    }

    fn write(&self, offset: usize, value: u32) {
        self.cell(offset).set(value)
    }
}

/// Byte offsets of the registers used by the driver
pub mod offset {
    /// Module Configuration
    pub const MCR: usize = 0x00;
    /// Control 1
    pub const CTRL1: usize = 0x04;
    /// Free Running Timer
    pub const TIMER: usize = 0x08;
    /// Rx Mailboxes Global Mask
    pub const RXMGMASK: usize = 0x10;
    /// Rx 14 Mask
    pub const RX14MASK: usize = 0x14;
    /// Rx 15 Mask
    pub const RX15MASK: usize = 0x18;
    /// Error Counter
    pub const ECR: usize = 0x1C;
    /// Error and Status 1
    pub const ESR1: usize = 0x20;
    /// Interrupt Masks 1 (buffers 0-31)
    pub const IMASK1: usize = 0x28;
    /// Interrupt Flags 1 (buffers 0-31)
    pub const IFLAG1: usize = 0x30;
    /// Control 2
    pub const CTRL2: usize = 0x34;
    /// Rx FIFO Global Mask
    pub const RXFGMASK: usize = 0x48;
    /// First message buffer
    pub const MB_BASE: usize = 0x80;
    /// Size of one message buffer in bytes
    pub const MB_SIZE: usize = 0x10;
    /// First individual mask register
    pub const RXIMR_BASE: usize = 0x880;
    /// Start of the RX FIFO acceptance table (occupies buffers 6 and 7)
    pub const FIFO_TABLE: usize = MB_BASE + 6 * MB_SIZE;

    /// Control/status word of message buffer `index`
    pub const fn mb_cs(index: usize) -> usize {
        MB_BASE + index * MB_SIZE
    }

    /// Identifier word of message buffer `index`
    pub const fn mb_id(index: usize) -> usize {
        mb_cs(index) + 0x4
    }

    /// Payload word `word` (0 or 1) of message buffer `index`
    pub const fn mb_data(index: usize, word: usize) -> usize {
        mb_cs(index) + 0x8 + 4 * word
    }

    /// Individual mask of message buffer (or FIFO table entry) `index`
    pub const fn rximr(index: usize) -> usize {
        RXIMR_BASE + 4 * index
    }

    /// RX FIFO acceptance table entry `index`
    pub const fn fifo_table(index: usize) -> usize {
        FIFO_TABLE + 4 * index
    }
}

macro_rules! impl_raw {
    ($($reg:ident),*) => {
        $(
            impl From<u32> for $reg {
                fn from(bits: u32) -> Self {
                    Self(bits)
                }
            }

            impl $reg {
                /// Raw register value
                pub fn bits(&self) -> u32 {
                    self.0
                }
            }
        )*
    };
}

impl_raw!(Mcr, Ctrl1, Esr1, Cs);

bitfield! {
    /// Module Configuration Register
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Mcr(u32);
    impl Debug;
    /// Module Disable
    pub mdis, set_mdis: 31;
    /// Freeze Enable
    pub frz, set_frz: 30;
    /// Rx FIFO Enable
    pub rfen, set_rfen: 29;
    /// Halt FlexCAN
    pub halt, set_halt: 28;
    /// FlexCAN Not Ready
    pub not_rdy, _: 27;
    /// Soft Reset
    pub soft_rst, set_soft_rst: 25;
    /// Freeze Mode Acknowledge
    pub frz_ack, _: 24;
    /// Supervisor Mode
    pub supv, set_supv: 23;
    /// Low-Power Mode Acknowledge
    pub lpm_ack, _: 20;
    /// Self Reception Disable
    pub srx_dis, set_srx_dis: 17;
    /// Individual Rx Masking And Queue Enable
    pub irmq, set_irmq: 16;
    /// Abort Enable
    pub aen, set_aen: 12;
    /// Number Of The Last Message Buffer
    pub u8, maxmb, set_maxmb: 6, 0;
}

impl Mcr {
    /// Module Disable
    pub const MDIS: u32 = 1 << 31;
    /// Freeze Enable
    pub const FRZ: u32 = 1 << 30;
    /// Rx FIFO Enable
    pub const RFEN: u32 = 1 << 29;
    /// Halt FlexCAN
    pub const HALT: u32 = 1 << 28;
    /// FlexCAN Not Ready
    pub const NOT_RDY: u32 = 1 << 27;
    /// Soft Reset
    pub const SOFT_RST: u32 = 1 << 25;
    /// Freeze Mode Acknowledge
    pub const FRZ_ACK: u32 = 1 << 24;
    /// Supervisor Mode
    pub const SUPV: u32 = 1 << 23;
    /// Low-Power Mode Acknowledge
    pub const LPM_ACK: u32 = 1 << 20;
    /// Self Reception Disable
    pub const SRX_DIS: u32 = 1 << 17;
    /// Individual Rx Masking And Queue Enable
    pub const IRMQ: u32 = 1 << 16;
    /// Abort Enable
    pub const AEN: u32 = 1 << 12;
    /// Number Of The Last Message Buffer
    pub const MAXMB: u32 = 0x7f;
}

bitfield! {
    /// Control 1 Register
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Ctrl1(u32);
    impl Debug;
    /// Prescaler Division Factor
    pub u8, presdiv, set_presdiv: 31, 24;
    /// Resync Jump Width
    pub u8, rjw, set_rjw: 23, 22;
    /// Phase Segment 1
    pub u8, pseg1, set_pseg1: 21, 19;
    /// Phase Segment 2
    pub u8, pseg2, set_pseg2: 18, 16;
    /// Bus Off Interrupt Mask
    pub boffmsk, set_boffmsk: 15;
    /// Error Interrupt Mask
    pub errmsk, set_errmsk: 14;
    /// CAN Engine Clock Source
    pub clksrc, set_clksrc: 13;
    /// Loop Back Mode
    pub lpb, set_lpb: 12;
    /// Listen-Only Mode
    pub lom, set_lom: 3;
    /// Propagation Segment
    pub u8, propseg, set_propseg: 2, 0;
}

impl Ctrl1 {
    /// Bus Off Interrupt Mask
    pub const BOFFMSK: u32 = 1 << 15;
    /// Error Interrupt Mask
    pub const ERRMSK: u32 = 1 << 14;
    /// CAN Engine Clock Source, only writable in disable mode
    pub const CLKSRC: u32 = 1 << 13;
    /// Bits only writable in freeze mode
    pub const FREEZE_ONLY: u32 = !(Self::BOFFMSK | Self::ERRMSK | Self::CLKSRC);
}

bitfield! {
    /// Error and Status 1 Register
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Esr1(u32);
    impl Debug;
    /// Bus Off Done Interrupt
    pub boff_done_int, _: 19;
    /// Synchronized to CAN bus
    pub synch, _: 18;
    /// Tx Error Warning
    pub tx_wrn, _: 9;
    /// Rx Error Warning
    pub rx_wrn, _: 8;
    /// Idle
    pub idle, _: 7;
    /// Fault Confinement State
    pub u8, fltconf, _: 5, 4;
    /// Currently receiving
    pub rx, _: 3;
    /// Bus Off Interrupt
    pub boff_int, _: 2;
    /// Error Interrupt
    pub err_int, _: 1;
}

impl Esr1 {
    /// Bus Off Done Interrupt
    pub const BOFF_DONE_INT: u32 = 1 << 19;
    /// Bus Off Interrupt
    pub const BOFF_INT: u32 = 1 << 2;
    /// Error Interrupt
    pub const ERR_INT: u32 = 1 << 1;
    /// Write-1-to-clear interrupt flags reported through the error handler
    pub const INTERRUPTS: u32 = Self::BOFF_DONE_INT | Self::BOFF_INT | Self::ERR_INT;
    /// Fault Confinement State field
    pub const FLTCONF: u32 = 0b11 << 4;
}

bitfield! {
    /// Control and status word of a message buffer
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Cs(u32);
    impl Debug;
    /// Message buffer code
    pub u8, code, set_code: 27, 24;
    /// Substitute Remote Request
    pub srr, set_srr: 22;
    /// ID Extended
    pub ide, set_ide: 21;
    /// Remote Transmission Request
    pub rtr, set_rtr: 20;
    /// Length of the data in bytes
    pub u8, dlc, set_dlc: 19, 16;
    /// Free-running counter time stamp
    pub u16, timestamp, _: 15, 0;
}

/// Position of a standard identifier in an identifier word
pub const ID_STD_SHIFT: u32 = 18;
/// Identifier bits of an identifier word
pub const ID_MASK: u32 = 0x1fff_ffff;
