// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Windowed flow control, one instance per channel.
//!
//! Outbound: user writes are queued, and on flush emitted as chunks of
//! at most `min(peer_max_packet, peer_window)` bytes, in order. Chunks
//! the window cannot cover stay queued until the peer adjusts; a queued
//! chunk may be split again if an adjustment only partially covers it.
//! A local EOF or close is a queue marker behind all pending writes, so
//! the promise of the last write always resolves before the EOF's.
//!
//! Inbound: the window we granted the peer is debited for every
//! accepted payload, and replenished (back to the initial size) once
//! delivery has consumed more than half of it.

use crate::Error;
use cryptovec::CryptoVec;
use futures::channel::oneshot;
use std::collections::VecDeque;

/// Completion handle for a queued write, EOF or close.
pub(crate) type Promise = oneshot::Sender<Result<(), Error>>;

enum Pending {
    Write {
        data: CryptoVec,
        ext: Option<u32>,
        promise: Option<Promise>,
    },
    Eof {
        promise: Option<Promise>,
    },
    Close,
}

/// One wire-ready piece popped off the queue.
pub(crate) enum Emission {
    /// A data chunk, guaranteed not to exceed the peer's maximum packet
    /// size nor the remaining window. The promise is present only on
    /// the final chunk of a write.
    Data {
        data: CryptoVec,
        ext: Option<u32>,
        promise: Option<Promise>,
    },
    Eof {
        promise: Option<Promise>,
    },
    Close,
}

pub(crate) struct FlowController {
    /// Receive window we have granted the peer.
    local_window: u32,
    local_initial_window: u32,

    /// Send window the peer has granted us.
    peer_window: u32,
    peer_initial_window: u32,
    peer_max_packet: u32,
    /// False until the open handshake fixes the peer parameters.
    connected: bool,

    pending: VecDeque<Pending>,
    /// How many queue entries have been flushed and may be emitted.
    flushed: usize,
    /// Bytes queued but not yet on the wire.
    queued_bytes: u64,
    writable: bool,
}

impl FlowController {
    pub fn new(local_window: u32) -> FlowController {
        FlowController {
            local_window,
            local_initial_window: local_window,
            peer_window: 0,
            peer_initial_window: 0,
            peer_max_packet: 0,
            connected: false,
            pending: VecDeque::new(),
            flushed: 0,
            queued_bytes: 0,
            writable: true,
        }
    }

    /// Record the peer's declared window and packet limit, once the
    /// open handshake fixes them. The writability watermarks derive
    /// from the declared window.
    pub fn connect(&mut self, peer_window: u32, peer_max_packet: u32) {
        self.peer_window = peer_window;
        self.peer_initial_window = peer_window;
        self.peer_max_packet = peer_max_packet;
        self.connected = true;
        self.update_writability();
    }

    pub fn set_local_window(&mut self, window: u32) {
        debug_assert_eq!(self.local_window, self.local_initial_window);
        self.local_window = window;
        self.local_initial_window = window;
    }

    pub fn local_initial_window(&self) -> u32 {
        self.local_initial_window
    }

    pub fn peer_max_packet(&self) -> Option<u32> {
        if self.connected {
            Some(self.peer_max_packet)
        } else {
            None
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Bytes the user has committed that the peer has not yet freed:
    /// queued bytes plus the consumed part of the declared window.
    fn outstanding(&self) -> u64 {
        let consumed =
            (self.peer_initial_window as u64).saturating_sub(self.peer_window as u64);
        self.queued_bytes + consumed
    }

    fn update_writability(&mut self) {
        if !self.connected {
            return;
        }
        let outstanding = self.outstanding();
        let high = self.peer_initial_window as u64;
        let low = (self.peer_initial_window / 2) as u64;
        if self.writable && outstanding > high {
            self.writable = false
        } else if !self.writable && (outstanding < low || outstanding == 0) {
            self.writable = true
        }
    }

    /// Queue a write. Not emitted until flushed.
    pub fn write(&mut self, data: CryptoVec, ext: Option<u32>, promise: Option<Promise>) {
        self.queued_bytes += data.len() as u64;
        self.pending.push_back(Pending::Write { data, ext, promise });
        self.update_writability();
    }

    /// Queue a local EOF behind all pending writes.
    pub fn queue_eof(&mut self, promise: Option<Promise>) {
        self.pending.push_back(Pending::Eof { promise });
    }

    /// Queue a local close behind all pending writes.
    pub fn queue_close(&mut self) {
        self.pending.push_back(Pending::Close);
    }

    /// Mark everything queued so far as flushed.
    pub fn flush_mark(&mut self) {
        self.flushed = self.pending.len();
    }

    /// Pop the next emittable piece, if the window permits one.
    pub fn pop_emittable(&mut self) -> Option<Emission> {
        if self.flushed == 0 {
            return None;
        }
        let split = match self.pending.front_mut() {
            None => return None,
            Some(&mut Pending::Write { ref mut data, ext, .. }) => {
                let budget = std::cmp::min(self.peer_max_packet, self.peer_window) as usize;
                if budget == 0 {
                    return None;
                }
                if data.len() > budget {
                    // Partial coverage: emit what fits, keep the rest
                    // (and the promise) queued.
                    let head = CryptoVec::from_slice(&data[..budget]);
                    let rest = CryptoVec::from_slice(&data[budget..]);
                    *data = rest;
                    Some((head, ext))
                } else {
                    None
                }
            }
            Some(&mut Pending::Eof { .. }) | Some(&mut Pending::Close) => None,
        };
        if let Some((head, ext)) = split {
            self.peer_window -= head.len() as u32;
            self.queued_bytes -= head.len() as u64;
            self.update_writability();
            return Some(Emission::Data { data: head, ext, promise: None });
        }
        let item = self.pending.pop_front()?;
        self.flushed -= 1;
        match item {
            Pending::Write { data, ext, promise } => {
                self.peer_window -= data.len() as u32;
                self.queued_bytes -= data.len() as u64;
                self.update_writability();
                Some(Emission::Data { data, ext, promise })
            }
            Pending::Eof { promise } => Some(Emission::Eof { promise }),
            Pending::Close => Some(Emission::Close),
        }
    }

    /// The peer added `n` bytes to our send window.
    pub fn window_adjust(&mut self, n: u32) -> Result<(), Error> {
        match self.peer_window.checked_add(n) {
            Some(w) => {
                self.peer_window = w;
                self.update_writability();
                Ok(())
            }
            None => Err(Error::ProtocolViolation),
        }
    }

    /// Debit the inbound window for an accepted payload.
    pub fn accept(&mut self, len: usize) -> Result<(), Error> {
        if len as u64 > self.local_window as u64 {
            return Err(Error::ProtocolViolation);
        }
        self.local_window -= len as u32;
        Ok(())
    }

    /// After a delivery: if more than half the granted window is gone,
    /// the peer gets it back. Returns the increment to send.
    pub fn replenish(&mut self) -> Option<u32> {
        if self.local_window > self.local_initial_window / 2 {
            return None;
        }
        let delta = self.local_initial_window - self.local_window;
        if delta == 0 {
            return None;
        }
        self.local_window = self.local_initial_window;
        Some(delta)
    }

    /// Fail every queued item with `err` and empty the queue.
    pub fn fail_pending(&mut self, err: Error) {
        for item in self.pending.drain(..) {
            let promise = match item {
                Pending::Write { promise, .. } => promise,
                Pending::Eof { promise } => promise,
                Pending::Close => None,
            };
            if let Some(p) = promise {
                let _ = p.send(Err(err));
            }
        }
        self.flushed = 0;
        self.queued_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(flow: &mut FlowController) -> Vec<Emission> {
        let mut out = Vec::new();
        while let Some(e) = flow.pop_emittable() {
            out.push(e)
        }
        out
    }

    fn data_lens(emissions: &[Emission]) -> Vec<usize> {
        emissions
            .iter()
            .map(|e| match e {
                Emission::Data { data, .. } => data.len(),
                _ => panic!("expected data"),
            })
            .collect()
    }

    #[test]
    fn chunks_respect_max_packet_and_window() {
        let mut flow = FlowController::new(1 << 24);
        flow.connect(10, 4);
        flow.write(CryptoVec::from_slice(&[0u8; 10]), None, None);
        flow.flush_mark();
        let out = drain(&mut flow);
        assert_eq!(data_lens(&out), vec![4, 4, 2]);
    }

    #[test]
    fn window_starved_write_stays_queued() {
        let mut flow = FlowController::new(1 << 24);
        flow.connect(5, 3);
        flow.write(CryptoVec::from_slice(b"abcdef"), None, None);
        flow.flush_mark();
        let out = drain(&mut flow);
        assert_eq!(data_lens(&out), vec![3, 2]);
        assert!(!flow.is_writable());

        // Partial adjust frees the last byte.
        flow.window_adjust(1).unwrap();
        let out = drain(&mut flow);
        assert_eq!(data_lens(&out), vec![1]);
        match &out[0] {
            Emission::Data { data, .. } => assert_eq!(&data[..], b"f"),
            _ => unreachable!(),
        }

        // Still below the low watermark until the peer catches up.
        assert!(!flow.is_writable());
        flow.window_adjust(1).unwrap();
        assert!(drain(&mut flow).is_empty());
        assert!(!flow.is_writable());
        flow.window_adjust(100).unwrap();
        assert!(flow.is_writable());
    }

    #[test]
    fn promise_rides_the_last_chunk() {
        let mut flow = FlowController::new(1 << 24);
        flow.connect(2, 8);
        let (tx, mut rx) = oneshot::channel();
        flow.write(CryptoVec::from_slice(b"abcd"), None, Some(tx));
        flow.flush_mark();
        let out = drain(&mut flow);
        assert_eq!(out.len(), 1);
        match out.into_iter().next().unwrap() {
            Emission::Data { data, promise, .. } => {
                assert_eq!(&data[..], b"ab");
                assert!(promise.is_none());
            }
            _ => unreachable!(),
        }
        assert_eq!(rx.try_recv(), Ok(None));

        flow.window_adjust(10).unwrap();
        let out = drain(&mut flow);
        match out.into_iter().next().unwrap() {
            Emission::Data { data, promise, .. } => {
                assert_eq!(&data[..], b"cd");
                assert!(promise.is_some());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn eof_waits_for_pending_writes() {
        let mut flow = FlowController::new(1 << 24);
        flow.connect(1, 8);
        flow.write(CryptoVec::from_slice(b"xy"), None, None);
        flow.queue_eof(None);
        flow.flush_mark();
        let out = drain(&mut flow);
        // Only one byte of the write fits; the EOF must stay behind the
        // remainder.
        assert_eq!(out.len(), 1);
        flow.window_adjust(5).unwrap();
        let out = drain(&mut flow);
        assert_eq!(out.len(), 2);
        match &out[0] {
            Emission::Data { data, .. } => assert_eq!(&data[..], b"y"),
            _ => panic!("expected data"),
        }
        match &out[1] {
            Emission::Eof { .. } => (),
            _ => panic!("expected eof"),
        }
    }

    #[test]
    fn unflushed_writes_do_not_emit() {
        let mut flow = FlowController::new(1 << 24);
        flow.connect(100, 10);
        flow.write(CryptoVec::from_slice(b"abc"), None, None);
        assert!(flow.pop_emittable().is_none());
        flow.flush_mark();
        assert!(flow.pop_emittable().is_some());
    }

    #[test]
    fn window_adjust_overflow_is_violation() {
        let mut flow = FlowController::new(1 << 24);
        flow.connect(0xffff_ffff, 1 << 24);
        assert_eq!(flow.window_adjust(1), Err(Error::ProtocolViolation));
    }

    #[test]
    fn inbound_window_underflow_is_violation() {
        let mut flow = FlowController::new(4);
        flow.accept(3).unwrap();
        assert_eq!(flow.accept(2), Err(Error::ProtocolViolation));
    }

    #[test]
    fn replenish_at_half_window() {
        let mut flow = FlowController::new(8);
        flow.accept(3).unwrap();
        // 5 of 8 left: above half, no adjust yet.
        assert_eq!(flow.replenish(), None);
        flow.accept(2).unwrap();
        // 3 of 8 left.
        assert_eq!(flow.replenish(), Some(5));
        assert_eq!(flow.replenish(), None);
    }

    #[test]
    fn failed_queue_resolves_promises() {
        let mut flow = FlowController::new(1 << 24);
        flow.connect(0, 8);
        let (tx, mut rx) = oneshot::channel();
        flow.write(CryptoVec::from_slice(b"abc"), None, Some(tx));
        flow.flush_mark();
        flow.fail_pending(Error::TcpShutdown);
        assert_eq!(rx.try_recv(), Ok(Some(Err(Error::TcpShutdown))));
    }
}
