// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The cross-worker shared-state region: a single fixed-layout block of shared
// memory holding the user table, the ledger, room membership bitsets, and the
// chat/transaction event rings. Every worker process maps the same physical
// pages (inherited across `fork`); synchronization is entirely through the
// embedded process-shared mutexes in `raw_mutex`, never through anything
// process-local.

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::raw_mutex::RawMutex;
use crate::wire::{Opcode, Status, OPCODE_SLOTS};

pub const MAX_USERS: usize = 1024;
pub const MAX_ROOMS: usize = 64;
pub const MAX_USERNAME: usize = 32;
pub const MAX_CHAT_MSG: usize = 256;
pub const CHAT_RING_SIZE: usize = 4096;
pub const TXN_RING_SIZE: usize = 4096;
pub const ROOM_WORDS: usize = MAX_USERS / 64;
pub const INITIAL_BALANCE: i64 = 100_000;

pub const SHM_MAGIC: u32 = 0x4E53_5348;
pub const SHM_VERSION: u32 = 1;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// 32-bit FNV-1a, used only for the username→slot hash. Distinct from
/// `shm_name::fnv1a_64`, which hashes shm segment names for macOS's 31-byte
/// name limit — the two have nothing to do with each other.
fn fnv1a_32(data: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for &b in data {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ChatEvent {
    pub seq: u64,
    pub ts_ms: u64,
    pub room_id: u16,
    pub from_user_id: u32,
    pub msg_len: u16,
    pub msg: [u8; MAX_CHAT_MSG],
}

impl ChatEvent {
    pub fn message(&self) -> &[u8] {
        &self.msg[..(self.msg_len as usize).min(MAX_CHAT_MSG)]
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TxnEvent {
    pub seq: u64,
    pub ts_ms: u64,
    pub opcode: u16,
    pub status: u16,
    pub from_user_id: u32,
    pub to_user_id: u32,
    pub amount: i64,
}

/// The full cross-worker shared-state layout. Always accessed through a
/// reference obtained from `SharedState::from_raw` over mapped shared memory
/// — never constructed by value, since its size (low single-digit megabytes,
/// dominated by the two event rings and the embedded per-account/per-room
/// mutexes) and internal mutability make a stack or `Box::new` instance
/// pointless.
#[repr(C)]
pub struct SharedState {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub server_nonce: AtomicU64,

    pub total_connections: AtomicU64,
    pub total_requests: AtomicU64,
    pub total_errors: AtomicU64,
    pub op_counts: [AtomicU64; OPCODE_SLOTS],

    user_mu: RawMutex,
    user_used: [std::cell::UnsafeCell<u8>; MAX_USERS],
    user_online: [std::cell::UnsafeCell<u8>; MAX_USERS],
    username: [std::cell::UnsafeCell<[u8; MAX_USERNAME]>; MAX_USERS],

    acct_mu: [RawMutex; MAX_USERS],
    balance: [std::cell::UnsafeCell<i64>; MAX_USERS],

    room_mu: [RawMutex; MAX_ROOMS],
    room_members: [std::cell::UnsafeCell<[u64; ROOM_WORDS]>; MAX_ROOMS],

    chat_mu: RawMutex,
    chat_write_seq: AtomicU64,
    chat_ring: [std::cell::UnsafeCell<ChatEvent>; CHAT_RING_SIZE],

    txn_mu: RawMutex,
    txn_write_seq: AtomicU64,
    txn_ring: [std::cell::UnsafeCell<TxnEvent>; TXN_RING_SIZE],
}

unsafe impl Sync for SharedState {}
unsafe impl Send for SharedState {}

impl SharedState {
    pub const SIZE: usize = std::mem::size_of::<SharedState>();

    /// Reinterpret a mapped shared-memory region as a `SharedState`.
    ///
    /// # Safety
    /// `mem` must point to at least `SharedState::SIZE` bytes of `MAP_SHARED`
    /// memory, and must outlive the returned reference.
    pub unsafe fn from_raw<'a>(mem: *mut u8) -> &'a SharedState {
        &*(mem as *const SharedState)
    }

    /// One-shot initialization, guarded by the magic+version check. Returns
    /// `true` if this call performed initialization, `false` if the region
    /// was already initialized by a prior call (in this or another process).
    pub fn init_if_needed(&self) -> io::Result<bool> {
        if self.magic.load(Ordering::Acquire) == SHM_MAGIC
            && self.version.load(Ordering::Acquire) == SHM_VERSION
        {
            return Ok(false);
        }

        unsafe {
            std::ptr::write_bytes(self as *const _ as *mut u8, 0, Self::SIZE);
        }

        self.user_mu.init_process_shared()?;
        self.chat_mu.init_process_shared()?;
        self.txn_mu.init_process_shared()?;
        for m in self.acct_mu.iter() {
            m.init_process_shared()?;
        }
        for m in self.room_mu.iter() {
            m.init_process_shared()?;
        }
        for b in self.balance.iter() {
            unsafe {
                *b.get() = INITIAL_BALANCE;
            }
        }

        let pid = std::process::id() as u64;
        let seed = now_ms() ^ (pid << 32);
        let nonce = seed ^ 0x9E37_79B9_7F4A_7C15;
        self.server_nonce.store(nonce, Ordering::Release);
        self.version.store(SHM_VERSION, Ordering::Release);
        // Magic is written last: it is the ready flag every other process
        // polls via `init_if_needed`/direct magic checks.
        self.magic.store(SHM_MAGIC, Ordering::Release);
        tracing::info!(nonce, "initialized shared state region");
        Ok(true)
    }

    pub fn nonce(&self) -> u64 {
        self.server_nonce.load(Ordering::Acquire)
    }

    pub fn record_request(&self, opcode: u16, failed: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if (opcode as usize) < OPCODE_SLOTS {
            self.op_counts[opcode as usize].fetch_add(1, Ordering::Relaxed);
        }
        if failed {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_connection(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    // -- user table ---------------------------------------------------------

    /// Find the slot for `name`, creating it on first use. Returns `None`
    /// only when the name is out of bounds or the table is full (caller maps
    /// the latter to `INTERNAL`).
    pub fn user_find_or_create(&self, name: &[u8]) -> io::Result<Option<u32>> {
        if name.is_empty() || name.len() >= MAX_USERNAME {
            return Ok(None);
        }
        let mut candidate = [0u8; MAX_USERNAME];
        candidate[..name.len()].copy_from_slice(name);

        let _guard = self.user_mu.lock()?;
        let start = (fnv1a_32(name) as usize) % MAX_USERS;
        for step in 0..MAX_USERS {
            let id = (start + step) % MAX_USERS;
            let used = unsafe { *self.user_used[id].get() };
            if used == 0 {
                unsafe {
                    *self.user_used[id].get() = 1;
                    *self.user_online[id].get() = 1;
                    *self.username[id].get() = candidate;
                }
                return Ok(Some(id as u32));
            }
            let existing = unsafe { *self.username[id].get() };
            if existing == candidate {
                unsafe {
                    *self.user_online[id].get() = 1;
                }
                return Ok(Some(id as u32));
            }
        }
        Ok(None)
    }

    pub fn user_is_valid(&self, user_id: u32) -> bool {
        (user_id as usize) < MAX_USERS && unsafe { *self.user_used[user_id as usize].get() } != 0
    }

    // -- rooms ---------------------------------------------------------------

    pub fn room_set_member(&self, room: u16, user: u32, member: bool) -> io::Result<bool> {
        if room as usize >= MAX_ROOMS || user as usize >= MAX_USERS {
            return Ok(false);
        }
        let _guard = self.room_mu[room as usize].lock()?;
        let word = user as usize / 64;
        let bit = user as usize % 64;
        unsafe {
            let bits = &mut *self.room_members[room as usize].get();
            if member {
                bits[word] |= 1u64 << bit;
            } else {
                bits[word] &= !(1u64 << bit);
            }
        }
        Ok(true)
    }

    /// Unlocked bit test, matching the reference implementation: membership
    /// reads are not serialized against concurrent joins/leaves, only
    /// mutation is.
    pub fn room_is_member(&self, room: u16, user: u32) -> bool {
        if room as usize >= MAX_ROOMS || user as usize >= MAX_USERS {
            return false;
        }
        let word = user as usize / 64;
        let bit = user as usize % 64;
        let bits = unsafe { &*self.room_members[room as usize].get() };
        (bits[word] >> bit) & 1 != 0
    }

    // -- chat ring -------------------------------------------------------------

    pub fn chat_append(&self, room: u16, from_user: u32, msg: &[u8]) -> io::Result<u64> {
        let len = msg.len().min(MAX_CHAT_MSG);
        let _guard = self.chat_mu.lock()?;
        let seq = self.chat_write_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let idx = (seq as usize) % CHAT_RING_SIZE;
        unsafe {
            let e = &mut *self.chat_ring[idx].get();
            e.seq = seq;
            e.ts_ms = now_ms();
            e.room_id = room;
            e.from_user_id = from_user;
            e.msg_len = len as u16;
            e.msg = [0u8; MAX_CHAT_MSG];
            e.msg[..len].copy_from_slice(&msg[..len]);
        }
        Ok(seq)
    }

    /// Unlocked peek at the latest seq, used only to seed a fresh worker's
    /// read cursor at startup (no history replay).
    pub fn chat_latest_seq(&self) -> u64 {
        self.chat_write_seq.load(Ordering::Acquire)
    }

    pub fn chat_read_from(&self, cursor: &mut u64, max_events: usize) -> io::Result<Vec<ChatEvent>> {
        let _guard = self.chat_mu.lock()?;
        let latest = self.chat_write_seq.load(Ordering::Acquire);
        let mut seq = *cursor;
        if seq + CHAT_RING_SIZE as u64 < latest {
            seq = latest.saturating_sub(CHAT_RING_SIZE as u64);
        }
        let mut out = Vec::new();
        let mut cur = seq + 1;
        while cur <= latest && out.len() < max_events {
            let idx = (cur as usize) % CHAT_RING_SIZE;
            out.push(unsafe { *self.chat_ring[idx].get() });
            seq = cur;
            cur += 1;
        }
        *cursor = seq;
        Ok(out)
    }

    // -- transaction ring --------------------------------------------------

    pub fn txn_append(
        &self,
        opcode: u16,
        status: u16,
        from: u32,
        to: u32,
        amount: i64,
    ) -> io::Result<u64> {
        let _guard = self.txn_mu.lock()?;
        let seq = self.txn_write_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let idx = (seq as usize) % TXN_RING_SIZE;
        unsafe {
            *self.txn_ring[idx].get() = TxnEvent {
                seq,
                ts_ms: now_ms(),
                opcode,
                status,
                from_user_id: from,
                to_user_id: to,
                amount,
            };
        }
        Ok(seq)
    }

    // -- ledger --------------------------------------------------------------

    pub fn account_balance(&self, user: u32) -> io::Result<i64> {
        let _guard = self.acct_mu[user as usize].lock()?;
        Ok(unsafe { *self.balance[user as usize].get() })
    }

    pub fn account_deposit(&self, user: u32, amount: i64) -> io::Result<i64> {
        let _guard = self.acct_mu[user as usize].lock()?;
        unsafe {
            let b = &mut *self.balance[user as usize].get();
            *b += amount;
            Ok(*b)
        }
    }

    /// `Ok(Ok(new_balance))` on success, `Ok(Err(current_balance))` when
    /// funds are insufficient (balance left untouched).
    pub fn account_withdraw(&self, user: u32, amount: i64) -> io::Result<Result<i64, i64>> {
        let _guard = self.acct_mu[user as usize].lock()?;
        unsafe {
            let b = &mut *self.balance[user as usize].get();
            if *b < amount {
                Ok(Err(*b))
            } else {
                *b -= amount;
                Ok(Ok(*b))
            }
        }
    }

    /// Locks both accounts in ascending user-id order to avoid deadlock
    /// against a concurrent transfer in the opposite direction. Callers must
    /// reject `from == to` before calling this — self-transfer under a
    /// single lock is a degenerate case better handled as a no-op at the
    /// handler layer than threaded through the locking logic here.
    ///
    /// `Ok(Ok(new_from_balance))` on success, `Ok(Err(current_from_balance))`
    /// when funds are insufficient.
    pub fn transfer(&self, from: u32, to: u32, amount: i64) -> io::Result<Result<i64, i64>> {
        debug_assert_ne!(from, to);
        let (a, b) = if from < to { (from, to) } else { (to, from) };
        let _guard_a = self.acct_mu[a as usize].lock()?;
        let _guard_b = self.acct_mu[b as usize].lock()?;
        unsafe {
            let from_bal = &mut *self.balance[from as usize].get();
            if *from_bal < amount {
                return Ok(Err(*from_bal));
            }
            *from_bal -= amount;
        }
        unsafe {
            let to_bal = &mut *self.balance[to as usize].get();
            *to_bal += amount;
        }
        Ok(Ok(unsafe { *self.balance[from as usize].get() }))
    }

    /// Sequentially locks every account and sums balances, then scans the
    /// txn ring's retention window for successful deposit/withdraw amounts.
    /// Returns `(current_total, expected_total, conserved)`. Only valid over
    /// the ring's retention window — see the asset-conservation note in
    /// the data model.
    pub fn check_asset_conservation(&self) -> io::Result<(i64, i64, bool)> {
        let mut current_total: i64 = 0;
        for i in 0..MAX_USERS {
            let _g = self.acct_mu[i].lock()?;
            current_total += unsafe { *self.balance[i].get() };
        }

        let initial_total = MAX_USERS as i64 * INITIAL_BALANCE;
        let mut deposits: i64 = 0;
        let mut withdrawals: i64 = 0;
        {
            let _g = self.txn_mu.lock()?;
            let latest = self.txn_write_seq.load(Ordering::Acquire);
            let start = if latest > TXN_RING_SIZE as u64 {
                latest - TXN_RING_SIZE as u64 + 1
            } else {
                1
            };
            for seq in start..=latest {
                let idx = (seq as usize) % TXN_RING_SIZE;
                let e = unsafe { *self.txn_ring[idx].get() };
                if e.seq != seq || e.status != Status::Ok as u16 {
                    continue;
                }
                if e.opcode == Opcode::Deposit as u16 {
                    deposits += e.amount;
                } else if e.opcode == Opcode::Withdraw as u16 {
                    withdrawals += e.amount;
                }
            }
        }

        let expected_total = initial_total + deposits - withdrawals;
        Ok((current_total, expected_total, current_total == expected_total))
    }
}
