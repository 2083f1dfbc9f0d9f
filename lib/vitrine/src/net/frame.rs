use byteorder::{ByteOrder, LittleEndian};

use crate::net::buffer::Buffer;

/// Wire framing: every document travels behind a 4-byte little-endian header
/// word. Bits 0..29 carry the payload length, bit 30 distinguishes data from
/// meta documents (clear = meta) and bit 31 flags the document as ready, that
/// is, as the final frame of a logical reply rather than a streaming
/// continuation.
pub const HEADER_SIZE: usize = 4;

const LENGTH_MASK: u32 = (1 << 30) - 1;
const DATA_BIT: u32 = 1 << 30;
const READY_BIT: u32 = 1 << 31;

pub const MAX_PAYLOAD: usize = LENGTH_MASK as usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    pub length: usize,
    pub data: bool,
    pub ready: bool,
}

impl FrameHeader {
    /// Header for a meta document. Meta documents are always complete.
    #[inline]
    pub fn meta(length: usize) -> FrameHeader {
        FrameHeader {
            length,
            data: false,
            ready: true,
        }
    }

    /// Header for a data document; `ready = false` marks a streaming
    /// continuation on the same transaction.
    #[inline]
    pub fn data(length: usize, ready: bool) -> FrameHeader {
        FrameHeader {
            length,
            data: true,
            ready,
        }
    }

    #[inline]
    pub fn pack(&self) -> u32 {
        assert!(self.length <= MAX_PAYLOAD, "Frame payload too large");

        let mut word = self.length as u32;
        if self.data {
            word |= DATA_BIT;
        }
        if self.ready {
            word |= READY_BIT;
        }
        word
    }

    #[inline]
    pub fn unpack(word: u32) -> FrameHeader {
        FrameHeader {
            length: (word & LENGTH_MASK) as usize,
            data: word & DATA_BIT != 0,
            ready: word & READY_BIT != 0,
        }
    }

    /// Peek the header at the head of the buffer. Returns `None` until the
    /// full header word is buffered.
    #[inline]
    pub fn peek(buffer: &Buffer) -> Option<FrameHeader> {
        let data = buffer.read_slice();

        if data.len() < HEADER_SIZE {
            return None;
        }

        Some(Self::unpack(LittleEndian::read_u32(&data[..HEADER_SIZE])))
    }
}

/// Appends a framed payload (header word plus payload bytes) to the buffer.
/// The caller is expected to have checked capacity for the full frame.
#[inline]
pub fn write_frame(buffer: &mut Buffer, header: FrameHeader, payload: &[u8]) {
    debug_assert_eq!(header.length, payload.len());

    let mut word = [0u8; HEADER_SIZE];
    LittleEndian::write_u32(&mut word, header.pack());
    buffer.append(&word);
    buffer.append(payload);
}

/// Serialises a framed payload straight into a byte vector.
#[inline]
pub fn frame_to_vec(header: FrameHeader, payload: &[u8], out: &mut Vec<u8>) {
    debug_assert_eq!(header.length, payload.len());

    let mut word = [0u8; HEADER_SIZE];
    LittleEndian::write_u32(&mut word, header.pack());
    out.extend_from_slice(&word);
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_roundtrip() {
        let headers = [
            FrameHeader::meta(0),
            FrameHeader::meta(17),
            FrameHeader::data(1024, true),
            FrameHeader::data(MAX_PAYLOAD, false),
        ];

        for header in &headers {
            assert_eq!(FrameHeader::unpack(header.pack()), *header);
        }
    }

    #[test]
    fn test_flag_bits_do_not_disturb_length() {
        let header = FrameHeader::data(MAX_PAYLOAD, true);
        let word = header.pack();

        assert_eq!(word & LENGTH_MASK, MAX_PAYLOAD as u32);
        assert_ne!(word & DATA_BIT, 0);
        assert_ne!(word & READY_BIT, 0);

        let meta = FrameHeader::meta(5);
        assert_eq!(meta.pack() & DATA_BIT, 0);
        assert_ne!(meta.pack() & READY_BIT, 0);
    }

    #[test]
    fn test_peek_requires_full_header() {
        let mut buffer = Buffer::new(65536);
        buffer.append(&[1, 2, 3]);
        assert_eq!(FrameHeader::peek(&buffer), None);

        buffer.clear();
        write_frame(&mut buffer, FrameHeader::data(3, false), &[9, 9, 9]);

        let header = FrameHeader::peek(&buffer).unwrap();
        assert_eq!(header.length, 3);
        assert!(header.data);
        assert!(!header.ready);
        assert_eq!(buffer.len(), HEADER_SIZE + 3);
    }

    #[test]
    #[should_panic(expected = "Frame payload too large")]
    fn test_oversized_payload_rejected() {
        let _ = FrameHeader::data(MAX_PAYLOAD + 1, true).pack();
    }
}
