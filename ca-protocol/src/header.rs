// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use crate::ProtocolError;

/// Largest value a short-form header field (`payload_size` or `count`) can
/// carry literally. `0xFFFF` is reserved as the extended-form sentinel, so
/// the short-form range tops out one below it.
pub const SHORT_FIELD_MAX: u32 = 0xFFFE;

const SHORT_HEADER_LEN: u32 = 16;
const EXT_HEADER_LEN: u32 = 24;

/// A decoded Channel Access message header. Fields keep their natural-width
/// types even though on the wire a non-extended header truncates
/// `payload_size`/`count` to 16 bits; callers should check `fits_short_form`
/// before re-encoding in place.
///
/// Field order and byte order are fixed by the wire protocol (big-endian,
/// §6): `command | payload_size | data_type | count | cid | response_specific`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hdr {
    pub command: u16,
    pub payload_size: u32,
    pub data_type: u16,
    pub count: u32,
    /// Client-assigned ID (`param1` in the original header; `cid` for most
    /// requests, `sid` is carried in the same wire slot for some replies).
    pub cid: u32,
    pub response_specific: u32,
}

impl Hdr {
    pub fn new(
        command: u16,
        payload_size: u32,
        data_type: u16,
        count: u32,
        cid: u32,
        response_specific: u32,
    ) -> Self {
        Self {
            command,
            payload_size,
            data_type,
            count,
            cid,
            response_specific,
        }
    }

    /// Whether this header's `payload_size`/`count` both fit in the 16-bit
    /// short form, i.e. encoding it does not require the extended form.
    pub fn fits_short_form(&self) -> bool {
        self.payload_size <= SHORT_FIELD_MAX && self.count <= SHORT_FIELD_MAX
    }

    /// Size in bytes this header will occupy on the wire: 16 bytes for the
    /// short form, 24 for the extended form.
    pub fn wire_len(&self) -> u32 {
        if self.fits_short_form() {
            SHORT_HEADER_LEN
        } else {
            EXT_HEADER_LEN
        }
    }

    /// Total bytes a complete message (header + padded payload) occupies in
    /// the stream, per the §8 invariant:
    /// `16 + (extended ? 8 : 0) + round_up(payload, 8)`.
    pub fn total_wire_len(&self) -> u32 {
        self.wire_len() + crate::round_up(self.payload_size, 8)
    }

    /// Encode this header to its wire form, appending to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        if self.fits_short_form() {
            out.extend_from_slice(&self.command.to_be_bytes());
            out.extend_from_slice(&(self.payload_size as u16).to_be_bytes());
            out.extend_from_slice(&self.data_type.to_be_bytes());
            out.extend_from_slice(&(self.count as u16).to_be_bytes());
            out.extend_from_slice(&self.cid.to_be_bytes());
            out.extend_from_slice(&self.response_specific.to_be_bytes());
        } else {
            out.extend_from_slice(&self.command.to_be_bytes());
            out.extend_from_slice(&0xFFFFu16.to_be_bytes());
            out.extend_from_slice(&self.data_type.to_be_bytes());
            out.extend_from_slice(&0x0000u16.to_be_bytes());
            out.extend_from_slice(&self.cid.to_be_bytes());
            out.extend_from_slice(&self.response_specific.to_be_bytes());
            out.extend_from_slice(&self.payload_size.to_be_bytes());
            out.extend_from_slice(&self.count.to_be_bytes());
        }
    }

    /// Decode a header from the front of `buf`. Returns the header and the
    /// number of bytes consumed (16 or 24), or `ProtocolError::Truncated` if
    /// `buf` does not yet hold a complete header.
    pub fn decode(buf: &[u8]) -> Result<(Self, u32), ProtocolError> {
        if buf.len() < SHORT_HEADER_LEN as usize {
            return Err(ProtocolError::Truncated);
        }

        let command = u16::from_be_bytes(buf[0..2].try_into().unwrap());
        let short_payload_size = u16::from_be_bytes(buf[2..4].try_into().unwrap());
        let data_type = u16::from_be_bytes(buf[4..6].try_into().unwrap());
        let short_count = u16::from_be_bytes(buf[6..8].try_into().unwrap());
        let cid = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let response_specific = u32::from_be_bytes(buf[12..16].try_into().unwrap());

        if short_payload_size == 0xFFFF && short_count == 0x0000 {
            if buf.len() < EXT_HEADER_LEN as usize {
                return Err(ProtocolError::Truncated);
            }

            let payload_size = u32::from_be_bytes(buf[16..20].try_into().unwrap());
            let count = u32::from_be_bytes(buf[20..24].try_into().unwrap());

            return Ok((
                Self {
                    command,
                    payload_size,
                    data_type,
                    count,
                    cid,
                    response_specific,
                },
                EXT_HEADER_LEN,
            ));
        }

        // A header claiming payload_size == 0xFFFF but a nonzero short count
        // (or vice versa) is not a valid extended-header signal and not a
        // valid short-form value either -- reject it rather than silently
        // truncating the sentinel into a literal value.
        if short_payload_size == 0xFFFF || short_count == 0xFFFF {
            return Err(ProtocolError::MalformedExtendedHeader);
        }

        Ok((
            Self {
                command,
                payload_size: short_payload_size as u32,
                data_type,
                count: short_count as u32,
                cid,
                response_specific,
            },
            SHORT_HEADER_LEN,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(h: Hdr) {
        let mut buf = Vec::new();
        h.encode(&mut buf);
        assert_eq!(buf.len() as u32, h.wire_len());

        let (decoded, consumed) = Hdr::decode(&buf).unwrap();
        assert_eq!(consumed, h.wire_len());
        assert_eq!(decoded, h);
    }

    #[test]
    fn short_form_roundtrip() {
        roundtrip(Hdr::new(1, 0x0000, 6, 0, 42, 0));
        roundtrip(Hdr::new(1, 0xFFFE, 6, 1, 42, 0));
        roundtrip(Hdr::new(1, 100, 6, 0xFFFE, 42, 0));
    }

    #[test]
    fn extended_form_roundtrip() {
        roundtrip(Hdr::new(15, 0xFFFF, 6, 0x10000, 7, 9));
        roundtrip(Hdr::new(15, 200_000, 6, 65_536, 7, 9));
    }

    #[test]
    fn extended_header_boundary_65536_elements() {
        // Boundary scenario 1: READ_NOTIFY with count = 65_536.
        let h = Hdr::new(15, 8, 6, 65_536, 1, 0);
        assert!(!h.fits_short_form());
        assert_eq!(h.wire_len(), 24);
        roundtrip(h);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let buf = [0u8; 10];
        assert!(matches!(Hdr::decode(&buf), Err(ProtocolError::Truncated)));
    }

    #[test]
    fn truncated_extended_header_is_rejected() {
        let mut buf = Vec::new();
        Hdr::new(1, 0xFFFF, 0, 0x10000, 0, 0).encode(&mut buf);
        buf.truncate(20);
        assert!(matches!(Hdr::decode(&buf), Err(ProtocolError::Truncated)));
    }

    #[test]
    fn total_wire_len_matches_invariant() {
        let h = Hdr::new(1, 13, 6, 1, 1, 0);
        assert_eq!(h.total_wire_len(), 16 + crate::round_up(13, 8));

        let h = Hdr::new(1, 200_000, 6, 1, 1, 0);
        assert_eq!(h.total_wire_len(), 24 + crate::round_up(200_000, 8));
    }
}
