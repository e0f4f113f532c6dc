// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Wire framing: fixed 32-byte big-endian header plus an opaque variable-length
// body, integrity-checked with a table-driven CRC32/IEEE-802.3. Binary layout
// matches the reference server's `ns_header_t` field-for-field.

use std::sync::OnceLock;

pub const MAGIC: u16 = 0x4E53;
pub const VERSION: u8 = 1;
pub const HEADER_LEN: u16 = 32;

pub const FLAG_ENCRYPTED: u8 = 1 << 0;
pub const FLAG_COMPRESSED: u8 = 1 << 1;
pub const FLAG_IS_RESPONSE: u8 = 1 << 2;

/// Request/response opcodes. `LOGOUT` is defined on the wire but reserved —
/// no handler branch emits or accepts it as a meaningful request today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Hello = 0x0001,
    Login = 0x0002,
    Logout = 0x0003,
    Heartbeat = 0x0004,
    JoinRoom = 0x0101,
    LeaveRoom = 0x0102,
    ChatSend = 0x0103,
    ChatBroadcast = 0x0104,
    Deposit = 0x0201,
    Withdraw = 0x0202,
    Transfer = 0x0203,
    Balance = 0x0204,
}

impl Opcode {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x0001 => Self::Hello,
            0x0002 => Self::Login,
            0x0003 => Self::Logout,
            0x0004 => Self::Heartbeat,
            0x0101 => Self::JoinRoom,
            0x0102 => Self::LeaveRoom,
            0x0103 => Self::ChatSend,
            0x0104 => Self::ChatBroadcast,
            0x0201 => Self::Deposit,
            0x0202 => Self::Withdraw,
            0x0203 => Self::Transfer,
            0x0204 => Self::Balance,
            _ => return None,
        })
    }
}

/// Number of op_counts[] slots the shared state reserves. The highest opcode
/// value is 0x0204 (BALANCE); round up generously so a future opcode in the
/// same numbering bands doesn't require a layout change.
pub const OPCODE_SLOTS: usize = 0x0300;

/// Status codes carried in the response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Ok = 0x0000,
    BadPacket = 0x0001,
    ChecksumFail = 0x0002,
    Unauthorized = 0x0003,
    NotFound = 0x0004,
    InsufficientFunds = 0x0005,
    ServerBusy = 0x0006,
    Timeout = 0x0007,
    Internal = 0x00FF,
}

/// A parsed 32-byte frame header.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub flags: u8,
    pub header_len: u16,
    pub body_len: u32,
    pub opcode: u16,
    pub status: u16,
    pub req_id: u64,
    pub checksum: u32,
}

impl Header {
    /// Build the 32-byte header bytes for a frame, with the checksum computed
    /// over (header-with-checksum-zeroed ∥ body).
    pub fn build(flags: u8, opcode: u16, status: u16, req_id: u64, body: &[u8]) -> [u8; 32] {
        let mut buf = [0u8; 32];
        write_header_fields(&mut buf, flags, opcode, status, req_id, body.len() as u32);
        let crc = frame_checksum(&buf, body);
        buf[20..24].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Parse and perform only the cheap structural checks: magic, version,
    /// header-length, and body-length bound. Does not touch the checksum.
    pub fn parse_basic(buf: &[u8; 32], max_body_len: u32) -> Option<Header> {
        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        let version = buf[2];
        let flags = buf[3];
        let header_len = u16::from_be_bytes([buf[4], buf[5]]);
        let body_len = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        let opcode = u16::from_be_bytes([buf[10], buf[11]]);
        let status = u16::from_be_bytes([buf[12], buf[13]]);
        let req_id = u64::from_be_bytes(buf[14..22].try_into().unwrap());
        let checksum = u32::from_be_bytes([buf[22], buf[23], buf[24], buf[25]]);

        if magic != MAGIC || version != VERSION || header_len != HEADER_LEN {
            return None;
        }
        if body_len > max_body_len {
            return None;
        }
        Some(Header {
            flags,
            header_len,
            body_len,
            opcode,
            status,
            req_id,
            checksum,
        })
    }

    /// Recompute the checksum over `raw_header` (with its checksum field
    /// zeroed) ∥ `body` and compare against the stored value.
    pub fn validate_checksum(&self, raw_header: &[u8; 32], body: &[u8]) -> bool {
        frame_checksum(raw_header, body) == self.checksum
    }
}

fn write_header_fields(
    buf: &mut [u8; 32],
    flags: u8,
    opcode: u16,
    status: u16,
    req_id: u64,
    body_len: u32,
) {
    buf[0..2].copy_from_slice(&MAGIC.to_be_bytes());
    buf[2] = VERSION;
    buf[3] = flags;
    buf[4..6].copy_from_slice(&HEADER_LEN.to_be_bytes());
    buf[6..10].copy_from_slice(&body_len.to_be_bytes());
    buf[10..12].copy_from_slice(&opcode.to_be_bytes());
    buf[12..14].copy_from_slice(&status.to_be_bytes());
    buf[14..22].copy_from_slice(&req_id.to_be_bytes());
    // buf[22..26] (checksum) left zero; caller fills it in after this call.
    // buf[26..32] (reserved) left zero.
}

/// CRC32 of `header` (with bytes 22..26 treated as zero) concatenated with `body`.
fn frame_checksum(header: &[u8; 32], body: &[u8]) -> u32 {
    let mut zeroed = *header;
    zeroed[22..26].fill(0);
    let mut crc = Crc32::new();
    crc.update(&zeroed);
    crc.update(body);
    crc.finish()
}

/// Standalone CRC32/IEEE-802.3 over an arbitrary buffer (used by LOGIN's
/// token derivation: `CRC32(name ∥ server_nonce_be64)`).
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(data);
    crc.finish()
}

// ---------------------------------------------------------------------------
// Table-driven CRC32/IEEE-802.3 (reflected, poly 0xEDB88320). The reference
// server computes the same value bit-by-bit; this is the ordinary table-driven
// replacement, not a different algorithm.
// ---------------------------------------------------------------------------

struct Crc32 {
    state: u32,
}

impl Crc32 {
    fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    fn update(&mut self, data: &[u8]) {
        let table = crc_table();
        let mut crc = self.state;
        for &byte in data {
            let idx = ((crc ^ byte as u32) & 0xFF) as usize;
            crc = table[idx] ^ (crc >> 8);
        }
        self.state = crc;
    }

    fn finish(self) -> u32 {
        self.state ^ 0xFFFF_FFFF
    }
}

fn crc_table() -> &'static [u32; 256] {
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut c = i as u32;
            let mut k = 0;
            while k < 8 {
                c = if c & 1 != 0 {
                    0xEDB8_8320 ^ (c >> 1)
                } else {
                    c >> 1
                };
                k += 1;
            }
            table[i] = c;
            i += 1;
        }
        table
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_value() {
        // Standard IEEE-802.3 CRC32 of ASCII "123456789" is 0xCBF43926.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn build_then_validate_roundtrip() {
        let body = b"hello world";
        let header = Header::build(0, Opcode::Hello as u16, Status::Ok as u16, 42, body);
        let parsed = Header::parse_basic(&header, 65536).expect("basic validation");
        assert_eq!(parsed.opcode, Opcode::Hello as u16);
        assert_eq!(parsed.req_id, 42);
        assert_eq!(parsed.body_len, body.len() as u32);
        assert!(parsed.validate_checksum(&header, body));
    }

    #[test]
    fn bit_flip_in_body_breaks_checksum() {
        let body = b"hello world".to_vec();
        let header = Header::build(0, Opcode::Balance as u16, Status::Ok as u16, 1, &body);
        let parsed = Header::parse_basic(&header, 65536).unwrap();
        let mut flipped = body.clone();
        flipped[0] ^= 0x01;
        assert!(!parsed.validate_checksum(&header, &flipped));
    }

    #[test]
    fn bit_flip_in_header_breaks_checksum() {
        let body = b"x";
        let header = Header::build(0, Opcode::Hello as u16, Status::Ok as u16, 7, body);
        let parsed = Header::parse_basic(&header, 65536).unwrap();
        let mut flipped = header;
        flipped[10] ^= 0x01; // opcode byte
        assert!(!parsed.validate_checksum(&flipped, body));
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut header = Header::build(0, Opcode::Hello as u16, Status::Ok as u16, 0, &[]);
        header[0] ^= 0xFF;
        assert!(Header::parse_basic(&header, 65536).is_none());
    }

    #[test]
    fn rejects_body_over_max() {
        let header = Header::build(0, Opcode::Hello as u16, Status::Ok as u16, 0, &[]);
        assert!(Header::parse_basic(&header, 0).is_none());
    }

    #[test]
    fn opcode_roundtrip_for_all_known_values() {
        let values = [
            0x0001, 0x0002, 0x0003, 0x0004, 0x0101, 0x0102, 0x0103, 0x0104, 0x0201, 0x0202,
            0x0203, 0x0204,
        ];
        for v in values {
            assert!(Opcode::from_u16(v).is_some(), "opcode {v:#x} should resolve");
        }
        assert!(Opcode::from_u16(0x9999).is_none());
    }
}
