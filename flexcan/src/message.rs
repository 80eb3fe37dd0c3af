//! Handling of messages/frames

use crate::message_buffer::Code;
use crate::reg::{Cs, ID_MASK, ID_STD_SHIFT};
use core::cmp::min;
use embedded_can::{ExtendedId, Frame, Id, StandardId};

/// Largest payload of a classic CAN frame
pub const MAX_DATA_LEN: usize = 8;

/// Data does not fit in a classic CAN frame
#[derive(Debug)]
pub struct TooMuchData;

/// Selects the type of the classic CAN frame
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameKind {
    /// Frame carrying a 0-8 byte payload
    #[default]
    Data,
    /// Requests transmission of the identified frame
    Remote,
}

/// One classic CAN frame, the unit exchanged with the message buffers.
///
/// Fields are public so a frame can be assembled directly; [`Can::send`]
/// rejects a `len` larger than [`MAX_DATA_LEN`].
///
/// Two frames are equal when they look the same on the bus; bytes past
/// `len` and the data bytes of remote frames are ignored.
///
/// [`Can::send`]: crate::bus::Can::send
#[derive(Debug, Copy, Clone, Eq)]
pub struct Message {
    /// CAN identifier; its variant selects the 11- or 29-bit format
    pub id: Id,
    /// Data or remote frame
    pub kind: FrameKind,
    /// Data length code. For remote frames, the length of the requested
    /// frame.
    pub len: u8,
    /// Payload; bytes past `len` are not transmitted
    pub data: [u8; MAX_DATA_LEN],
}

impl Message {
    /// Data frame carrying `data`
    pub fn new_data(id: impl Into<Id>, data: &[u8]) -> Result<Self, TooMuchData> {
        if data.len() > MAX_DATA_LEN {
            return Err(TooMuchData);
        }
        let mut payload = [0; MAX_DATA_LEN];
        payload[..data.len()].copy_from_slice(data);
        Ok(Self {
            id: id.into(),
            kind: FrameKind::Data,
            len: data.len() as u8,
            data: payload,
        })
    }

    /// Remote frame requesting `len` bytes
    pub fn new_remote(id: impl Into<Id>, len: u8) -> Result<Self, TooMuchData> {
        if usize::from(len) > MAX_DATA_LEN {
            return Err(TooMuchData);
        }
        Ok(Self {
            id: id.into(),
            kind: FrameKind::Remote,
            len,
            data: [0; MAX_DATA_LEN],
        })
    }

    /// Transmitted part of the payload. Empty for remote frames.
    pub fn payload(&self) -> &[u8] {
        match self.kind {
            FrameKind::Data => &self.data[..min(usize::from(self.len), MAX_DATA_LEN)],
            FrameKind::Remote => &[],
        }
    }

    /// `true` if the identifier uses the extended (29-bit) format
    pub fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    /// Identifier word in the message buffer layout
    pub(crate) fn id_word(&self) -> u32 {
        id_word(self.id)
    }

    /// Payload words in the message buffer layout (byte 0 is the most
    /// significant byte of word 0)
    pub(crate) fn data_words(&self) -> [u32; 2] {
        match self.kind {
            FrameKind::Data => {
                let mut bytes = [0; MAX_DATA_LEN];
                let payload = self.payload();
                bytes[..payload.len()].copy_from_slice(payload);
                [
                    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                    u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
                ]
            }
            FrameKind::Remote => [0; 2],
        }
    }

    /// Control word describing the frame, with `code` as the buffer code
    pub(crate) fn control_word(&self, code: Code) -> Cs {
        let mut cs = Cs::default();
        cs.set_code(code.into());
        cs.set_ide(self.is_extended());
        // Extended frames carry a recessive SRR bit
        cs.set_srr(self.is_extended());
        cs.set_rtr(self.kind == FrameKind::Remote);
        cs.set_dlc(self.len);
        cs
    }

    /// Rebuilds a frame from the words of a message buffer
    pub(crate) fn decode(cs: Cs, id_word: u32, data: [u32; 2]) -> Self {
        let id = if cs.ide() {
            // The mask ensures the ID is in range for a 29-bit integer
            Id::Extended(unsafe { ExtendedId::new_unchecked(id_word & ID_MASK) })
        } else {
            // The mask ensures the ID is in range for a 11-bit integer
            Id::Standard(unsafe {
                StandardId::new_unchecked((id_word >> ID_STD_SHIFT) as u16 & StandardId::MAX.as_raw())
            })
        };
        let len = min(cs.dlc(), MAX_DATA_LEN as u8);
        let (kind, data) = if cs.rtr() {
            (FrameKind::Remote, [0; MAX_DATA_LEN])
        } else {
            let [a, b, c, d] = data[0].to_be_bytes();
            let [e, f, g, h] = data[1].to_be_bytes();
            let mut bytes = [a, b, c, d, e, f, g, h];
            bytes[usize::from(len)..].fill(0);
            (FrameKind::Data, bytes)
        };
        Self {
            id,
            kind,
            len,
            data,
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.len == other.len
            && self.payload() == other.payload()
    }
}

/// `id` in the identifier word layout of message buffers and masks
pub(crate) fn id_word(id: Id) -> u32 {
    match id {
        Id::Standard(id) => u32::from(id.as_raw()) << ID_STD_SHIFT,
        Id::Extended(id) => id.as_raw(),
    }
}

impl Frame for Message {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        Self::new_data(id, data).ok()
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        Self::new_remote(id, u8::try_from(dlc).ok()?).ok()
    }

    fn is_extended(&self) -> bool {
        Message::is_extended(self)
    }

    fn is_remote_frame(&self) -> bool {
        self.kind == FrameKind::Remote
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.len.into()
    }

    fn data(&self) -> &[u8] {
        self.payload()
    }
}
