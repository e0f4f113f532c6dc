// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-connection state: the socket, the auth/session flag, the accumulating
// read buffer, and a growable write queue. Owned exclusively by the worker
// that accepted the connection — nothing here is shared across processes.

use std::collections::VecDeque;
use std::net::TcpStream;

use crate::wire::Header;

pub struct Connection {
    pub stream: TcpStream,
    pub peer_addr: String,
    pub authed: bool,
    pub user_id: u32,
    /// Bytes read off the socket but not yet assembled into a complete frame.
    /// Grows as partial reads arrive and is drained by `take_frame`.
    read_buf: Vec<u8>,
    write_queue: VecDeque<u8>,
    pub want_write: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: String, max_frame_len: usize) -> Self {
        Self {
            stream,
            peer_addr,
            authed: false,
            user_id: u32::MAX,
            read_buf: Vec::with_capacity(max_frame_len),
            write_queue: VecDeque::new(),
            want_write: false,
        }
    }

    pub fn read_buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.read_buf
    }

    /// Pull one complete frame (header + body) off the front of the read
    /// buffer, if present, compacting the buffer. `max_body_len` bounds the
    /// accepted body length; anything larger is a protocol error the caller
    /// must handle by closing the connection.
    pub fn take_frame(&mut self, max_body_len: u32) -> Option<Result<([u8; 32], Vec<u8>), ()>> {
        if self.read_buf.len() < 32 {
            return None;
        }
        let mut header_bytes = [0u8; 32];
        header_bytes.copy_from_slice(&self.read_buf[..32]);

        let header = match Header::parse_basic(&header_bytes, max_body_len) {
            Some(h) => h,
            None => return Some(Err(())),
        };

        let total = 32 + header.body_len as usize;
        if self.read_buf.len() < total {
            return None;
        }

        let body = self.read_buf[32..total].to_vec();
        self.read_buf.drain(..total);
        Some(Ok((header_bytes, body)))
    }

    pub fn queue_write(&mut self, bytes: &[u8]) {
        self.write_queue.extend(bytes.iter().copied());
        self.want_write = true;
    }

    pub fn has_pending_write(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// Drain as much of the write queue as the socket will currently accept.
    /// Returns `Ok(true)` if the queue fully drained, `Ok(false)` if the
    /// socket would block with bytes still pending.
    pub fn flush(&mut self) -> std::io::Result<bool> {
        use std::io::Write;
        while !self.write_queue.is_empty() {
            let (front, _) = self.write_queue.as_slices();
            match self.stream.write(front) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.write_queue.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.want_write = false;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Opcode, Status};
    use std::net::{TcpListener, TcpStream};

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn take_frame_waits_for_full_body() {
        let (_client, server) = loopback_pair();
        let mut conn = Connection::new(server, "test".into(), 65536);
        let header = Header::build(0, Opcode::Hello as u16, Status::Ok as u16, 1, b"abc");
        conn.read_buf_mut().extend_from_slice(&header);
        conn.read_buf_mut().extend_from_slice(b"ab");
        assert!(conn.take_frame(65536).is_none());

        conn.read_buf_mut().extend_from_slice(b"c");
        let (_, body) = conn.take_frame(65536).unwrap().unwrap();
        assert_eq!(body, b"abc");
        assert!(conn.read_buf_mut().is_empty());
    }

    #[test]
    fn take_frame_rejects_bad_magic() {
        let (_client, server) = loopback_pair();
        let mut conn = Connection::new(server, "test".into(), 65536);
        let mut header = Header::build(0, Opcode::Hello as u16, Status::Ok as u16, 1, &[]);
        header[0] ^= 0xFF;
        conn.read_buf_mut().extend_from_slice(&header);
        assert!(conn.take_frame(65536).unwrap().is_err());
    }
}
