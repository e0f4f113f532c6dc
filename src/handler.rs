// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Request dispatch: a pure function of (shared state, connection, parsed
// header, body) that produces exactly one response frame per request and
// whatever side effects on shared state the opcode calls for. Broadcasts are
// not emitted here — the worker's chat-ring drain does that separately.

use tracing::warn;

use crate::connection::Connection;
use crate::state::{SharedState, MAX_CHAT_MSG, MAX_ROOMS};
use crate::wakeup::Wakeup;
use crate::wire::{Header, Opcode, Status};

/// Dispatch one request and enqueue its response onto `conn`'s write queue.
pub fn handle(shared: &SharedState, wakeup: &Wakeup, conn: &mut Connection, header: &Header, body: &[u8]) {
    let opcode = Opcode::from_u16(header.opcode);

    let (status, resp_body) = if header.flags & crate::wire::FLAG_ENCRYPTED != 0 {
        // Reserved: nothing in this server builds or validates encrypted
        // frames, so one can never be interpreted correctly.
        (Status::BadPacket, Vec::new())
    } else {
        match opcode {
            None => (Status::BadPacket, Vec::new()),
            Some(op) => {
                if !conn.authed && !matches!(op, Opcode::Hello | Opcode::Login | Opcode::Heartbeat) {
                    (Status::Unauthorized, Vec::new())
                } else {
                    dispatch(shared, wakeup, conn, op, body)
                }
            }
        }
    };

    let failed = status != Status::Ok;
    shared.record_request(header.opcode, failed);

    let resp_header = Header::build(
        crate::wire::FLAG_IS_RESPONSE,
        header.opcode,
        status as u16,
        header.req_id,
        &resp_body,
    );
    conn.queue_write(&resp_header);
    conn.queue_write(&resp_body);
}

fn dispatch(
    shared: &SharedState,
    wakeup: &Wakeup,
    conn: &mut Connection,
    op: Opcode,
    body: &[u8],
) -> (Status, Vec<u8>) {
    match op {
        Opcode::Hello => {
            let mut resp = Vec::with_capacity(8);
            resp.extend_from_slice(&shared.nonce().to_be_bytes());
            (Status::Ok, resp)
        }

        Opcode::Login => handle_login(shared, conn, body),

        Opcode::Heartbeat => (Status::Ok, Vec::new()),

        Opcode::JoinRoom | Opcode::LeaveRoom => {
            if body.len() != 2 {
                return (Status::BadPacket, Vec::new());
            }
            let room = u16::from_be_bytes([body[0], body[1]]);
            if room as usize >= MAX_ROOMS {
                return (Status::BadPacket, Vec::new());
            }
            let member = matches!(op, Opcode::JoinRoom);
            match shared.room_set_member(room, conn.user_id, member) {
                Ok(true) => (Status::Ok, Vec::new()),
                Ok(false) => (Status::BadPacket, Vec::new()),
                Err(e) => {
                    warn!(error = %e, "room lock failed");
                    (Status::Internal, Vec::new())
                }
            }
        }

        Opcode::ChatSend => handle_chat_send(shared, wakeup, conn, body),

        Opcode::Deposit => handle_deposit(shared, conn, body),
        Opcode::Withdraw => handle_withdraw(shared, conn, body),
        Opcode::Transfer => handle_transfer(shared, conn, body),
        Opcode::Balance => match shared.account_balance(conn.user_id) {
            Ok(bal) => (Status::Ok, bal.to_be_bytes().to_vec()),
            Err(e) => {
                warn!(error = %e, "account lock failed");
                (Status::Internal, Vec::new())
            }
        },

        // CHAT_BROADCAST and LOGOUT are not valid client-originated requests.
        Opcode::ChatBroadcast | Opcode::Logout => (Status::BadPacket, Vec::new()),
    }
}

fn handle_login(shared: &SharedState, conn: &mut Connection, body: &[u8]) -> (Status, Vec<u8>) {
    if body.len() < 2 {
        return (Status::BadPacket, Vec::new());
    }
    let name_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    if name_len == 0 || name_len >= 32 || body.len() < 2 + name_len + 4 {
        return (Status::BadPacket, Vec::new());
    }
    let name = &body[2..2 + name_len];
    let token_off = 2 + name_len;
    let token = u32::from_be_bytes(body[token_off..token_off + 4].try_into().unwrap());

    let mut expected_input = Vec::with_capacity(name_len + 8);
    expected_input.extend_from_slice(name);
    expected_input.extend_from_slice(&shared.nonce().to_be_bytes());
    let expected = crate::wire::crc32(&expected_input);

    if token != expected {
        return (Status::Unauthorized, Vec::new());
    }

    match shared.user_find_or_create(name) {
        Ok(Some(user_id)) => {
            conn.authed = true;
            conn.user_id = user_id;
            let balance = match shared.account_balance(user_id) {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "account lock failed during login");
                    return (Status::Internal, Vec::new());
                }
            };
            let mut resp = Vec::with_capacity(12);
            resp.extend_from_slice(&user_id.to_be_bytes());
            resp.extend_from_slice(&balance.to_be_bytes());
            (Status::Ok, resp)
        }
        Ok(None) => (Status::Internal, Vec::new()),
        Err(e) => {
            warn!(error = %e, "user lock failed");
            (Status::Internal, Vec::new())
        }
    }
}

fn handle_chat_send(
    shared: &SharedState,
    wakeup: &Wakeup,
    conn: &mut Connection,
    body: &[u8],
) -> (Status, Vec<u8>) {
    if body.len() < 4 {
        return (Status::BadPacket, Vec::new());
    }
    let room = u16::from_be_bytes([body[0], body[1]]);
    let msg_len = u16::from_be_bytes([body[2], body[3]]) as usize;
    if room as usize >= MAX_ROOMS || msg_len > MAX_CHAT_MSG || body.len() != 4 + msg_len {
        return (Status::BadPacket, Vec::new());
    }
    if !shared.room_is_member(room, conn.user_id) {
        return (Status::Unauthorized, Vec::new());
    }

    let msg = &body[4..4 + msg_len];
    match shared.chat_append(room, conn.user_id, msg) {
        Ok(_) => {
            if let Err(e) = wakeup.notify() {
                warn!(error = %e, "failed to nudge wakeup primitive");
            }
            (Status::Ok, Vec::new())
        }
        Err(e) => {
            warn!(error = %e, "chat lock failed");
            (Status::Internal, Vec::new())
        }
    }
}

fn handle_deposit(shared: &SharedState, conn: &mut Connection, body: &[u8]) -> (Status, Vec<u8>) {
    if body.len() != 8 {
        return (Status::BadPacket, Vec::new());
    }
    let amount = i64::from_be_bytes(body.try_into().unwrap());
    if amount <= 0 {
        return (Status::BadPacket, Vec::new());
    }
    match shared.account_deposit(conn.user_id, amount) {
        Ok(new_balance) => {
            log_txn(shared, Opcode::Deposit, Status::Ok, conn.user_id, 0, amount);
            (Status::Ok, new_balance.to_be_bytes().to_vec())
        }
        Err(e) => {
            warn!(error = %e, "account lock failed");
            (Status::Internal, Vec::new())
        }
    }
}

fn handle_withdraw(shared: &SharedState, conn: &mut Connection, body: &[u8]) -> (Status, Vec<u8>) {
    if body.len() != 8 {
        return (Status::BadPacket, Vec::new());
    }
    let amount = i64::from_be_bytes(body.try_into().unwrap());
    if amount <= 0 {
        return (Status::BadPacket, Vec::new());
    }
    match shared.account_withdraw(conn.user_id, amount) {
        Ok(Ok(new_balance)) => {
            log_txn(shared, Opcode::Withdraw, Status::Ok, conn.user_id, 0, amount);
            (Status::Ok, new_balance.to_be_bytes().to_vec())
        }
        Ok(Err(current_balance)) => {
            log_txn(
                shared,
                Opcode::Withdraw,
                Status::InsufficientFunds,
                conn.user_id,
                0,
                amount,
            );
            (Status::InsufficientFunds, current_balance.to_be_bytes().to_vec())
        }
        Err(e) => {
            warn!(error = %e, "account lock failed");
            (Status::Internal, Vec::new())
        }
    }
}

fn handle_transfer(shared: &SharedState, conn: &mut Connection, body: &[u8]) -> (Status, Vec<u8>) {
    if body.len() != 12 {
        return (Status::BadPacket, Vec::new());
    }
    let to_user_id = u32::from_be_bytes(body[0..4].try_into().unwrap());
    let amount = i64::from_be_bytes(body[4..12].try_into().unwrap());
    if amount <= 0 || !shared.user_is_valid(to_user_id) {
        return (Status::BadPacket, Vec::new());
    }
    // Self-transfer is a no-op: it needs neither the deadlock-avoidance path
    // (only one lock would ever be taken) nor a ledger entry.
    if to_user_id == conn.user_id {
        return match shared.account_balance(conn.user_id) {
            Ok(bal) => (Status::Ok, bal.to_be_bytes().to_vec()),
            Err(e) => {
                warn!(error = %e, "account lock failed");
                (Status::Internal, Vec::new())
            }
        };
    }

    match shared.transfer(conn.user_id, to_user_id, amount) {
        Ok(Ok(new_from_balance)) => {
            log_txn(
                shared,
                Opcode::Transfer,
                Status::Ok,
                conn.user_id,
                to_user_id,
                amount,
            );
            (Status::Ok, new_from_balance.to_be_bytes().to_vec())
        }
        Ok(Err(current_balance)) => {
            log_txn(
                shared,
                Opcode::Transfer,
                Status::InsufficientFunds,
                conn.user_id,
                to_user_id,
                amount,
            );
            (Status::InsufficientFunds, current_balance.to_be_bytes().to_vec())
        }
        Err(e) => {
            warn!(error = %e, "account lock failed");
            (Status::Internal, Vec::new())
        }
    }
}

fn log_txn(shared: &SharedState, op: Opcode, status: Status, from: u32, to: u32, amount: i64) {
    if let Err(e) = shared.txn_append(op as u16, status as u16, from, to, amount) {
        warn!(error = %e, "txn lock failed");
    }
}
