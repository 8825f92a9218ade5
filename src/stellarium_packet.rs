// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Binary messages of the Stellarium Telescope Protocol. All fields are
// little-endian.
//
// Server to client ("current position"), 24 bytes:
//   i16 length (24), i16 type (0), i64 microseconds since epoch,
//   u32 ra, i32 dec, i32 status (0 == OK)
//
// Client to server ("goto"), 20 bytes:
//   i16 length (20), i16 type (0), i64 microseconds since epoch,
//   u32 ra, i32 dec

use std::time::{SystemTime, UNIX_EPOCH};

pub const STATUS_PACKET_LEN: usize = 24;
pub const GOTO_PACKET_LEN: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusPacket {
    pub micros: i64,
    pub ra: u32,
    pub dec: i32,
    pub status: i32,
}

impl StatusPacket {
    pub fn new(micros: i64, ra: u32, dec: i32) -> Self {
        StatusPacket{micros, ra, dec, status: 0}
    }

    pub fn encode(&self) -> [u8; STATUS_PACKET_LEN] {
        let mut buf = [0_u8; STATUS_PACKET_LEN];
        buf[0..2].copy_from_slice(&(STATUS_PACKET_LEN as i16).to_le_bytes());
        buf[2..4].copy_from_slice(&0_i16.to_le_bytes());
        buf[4..12].copy_from_slice(&self.micros.to_le_bytes());
        buf[12..16].copy_from_slice(&self.ra.to_le_bytes());
        buf[16..20].copy_from_slice(&self.dec.to_le_bytes());
        buf[20..24].copy_from_slice(&self.status.to_le_bytes());
        buf
    }

    // Client side of the exchange; returns None if `buf` is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let buf: &[u8; STATUS_PACKET_LEN] =
            buf.get(..STATUS_PACKET_LEN)?.try_into().ok()?;
        Some(StatusPacket{
            micros: i64::from_le_bytes(buf[4..12].try_into().ok()?),
            ra: u32::from_le_bytes(buf[12..16].try_into().ok()?),
            dec: i32::from_le_bytes(buf[16..20].try_into().ok()?),
            status: i32::from_le_bytes(buf[20..24].try_into().ok()?),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GotoPacket {
    // As declared by the client. Stellarium always sends 20.
    pub length: i16,
    pub micros: i64,
    pub ra: u32,
    pub dec: i32,
}

impl GotoPacket {
    pub fn new(micros: i64, ra: u32, dec: i32) -> Self {
        GotoPacket{length: GOTO_PACKET_LEN as i16, micros, ra, dec}
    }

    // Returns None if `buf` holds less than a full packet. Bytes beyond the
    // first GOTO_PACKET_LEN are ignored.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let buf: &[u8; GOTO_PACKET_LEN] =
            buf.get(..GOTO_PACKET_LEN)?.try_into().ok()?;
        Some(GotoPacket{
            length: i16::from_le_bytes(buf[0..2].try_into().ok()?),
            micros: i64::from_le_bytes(buf[4..12].try_into().ok()?),
            ra: u32::from_le_bytes(buf[12..16].try_into().ok()?),
            dec: i32::from_le_bytes(buf[16..20].try_into().ok()?),
        })
    }

    // Client side of the exchange.
    pub fn encode(&self) -> [u8; GOTO_PACKET_LEN] {
        let mut buf = [0_u8; GOTO_PACKET_LEN];
        buf[0..2].copy_from_slice(&self.length.to_le_bytes());
        buf[2..4].copy_from_slice(&0_i16.to_le_bytes());
        buf[4..12].copy_from_slice(&self.micros.to_le_bytes());
        buf[12..16].copy_from_slice(&self.ra.to_le_bytes());
        buf[16..20].copy_from_slice(&self.dec.to_le_bytes());
        buf
    }
}

/// Microseconds since the epoch, for packet timestamps.
pub fn now_micros() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_micros() as i64,
        // Clock is set before 1970.
        Err(_) => 0,
    }
}
