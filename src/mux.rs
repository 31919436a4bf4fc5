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

//! The multiplexer: owns the channel map, allocates local IDs, routes
//! inbound messages to the addressed child, and serializes everything
//! the children emit into one ordered stream handed to the delegate.

use crate::channel::ChildChannel;
use crate::msg::{ChannelType, Msg};
use crate::{ChannelId, ChannelOpenFailure, CloseMode, Config, Error};
use cryptovec::CryptoVec;
use futures::channel::oneshot;
use std::collections::{HashMap, HashSet};
use std::num::Wrapping;

/// The transport-side collaborator of a [`Multiplexer`].
///
/// The multiplexer hands every outbound message to
/// [`write_from_parent`](MuxDelegate::write_from_parent), in emission
/// order, and signals the end of each write burst with
/// [`flush_from_parent`](MuxDelegate::flush_from_parent). Ownership of
/// payload buffers moves with the message.
///
/// The multiplexer is single-threaded and run-to-completion; a
/// delegate is invoked only from within multiplexer calls, on the
/// calling thread. Code running elsewhere must hop onto the executor
/// that owns the multiplexer before touching it.
pub trait MuxDelegate {
    /// Serialize and queue one message on the transport.
    fn write_from_parent(&mut self, msg: Msg) -> Result<(), Error>;

    /// The current write burst is over; flush the transport.
    fn flush_from_parent(&mut self);
}

type Initializer = Box<dyn FnMut(&mut ChildChannel) -> Result<(), Error>>;

/// The channel multiplexer of one SSH connection.
///
/// Owns every live channel, keyed by local ID. Children never refer to
/// the multiplexer directly; anything they emit goes through an outbox
/// the multiplexer drains into its delegate after every operation.
pub struct Multiplexer<D: MuxDelegate> {
    config: Config,
    delegate: Option<D>,
    parent_active: bool,
    channels: HashMap<ChannelId, ChildChannel>,
    /// IDs of channels torn down on error, still shielded from the
    /// peer's in-flight traffic. An entry retires when the peer's
    /// `ChannelClose` for it arrives.
    grace: HashSet<ChannelId>,
    next_id: Wrapping<u32>,
    inbound_initializer: Option<Initializer>,
    out: Vec<Msg>,
}

impl<D: MuxDelegate> Multiplexer<D> {
    /// Create a multiplexer speaking to the given transport delegate.
    pub fn new(config: Config, delegate: D) -> Multiplexer<D> {
        Multiplexer {
            config,
            delegate: Some(delegate),
            parent_active: true,
            channels: HashMap::new(),
            grace: HashSet::new(),
            next_id: Wrapping(0),
            inbound_initializer: None,
            out: Vec::new(),
        }
    }

    /// Accept channels the peer opens. Without an initializer, every
    /// inbound `ChannelOpen` is refused as administratively prohibited.
    pub fn set_inbound_initializer<F>(&mut self, init: F)
    where
        F: FnMut(&mut ChildChannel) -> Result<(), Error> + 'static,
    {
        self.inbound_initializer = Some(Box::new(init));
    }

    /// Open a channel towards the peer.
    ///
    /// The initializer runs synchronously on the not-yet-active channel
    /// (install the handler, set options); if it fails, nothing reaches
    /// the wire. The returned handle resolves once the peer confirms or
    /// rejects the open.
    pub fn create_child_channel<F>(
        &mut self,
        typ: ChannelType,
        init: F,
    ) -> Result<oneshot::Receiver<Result<ChannelId, Error>>, Error>
    where
        F: FnOnce(&mut ChildChannel) -> Result<(), Error>,
    {
        if !self.parent_active {
            return Err(Error::TcpShutdown);
        }
        if self.delegate.is_none() {
            return Err(Error::ProtocolViolation);
        }
        let id = self.alloc_id();
        let mut chan = ChildChannel::new(id, typ.clone(), &self.config);
        init(&mut chan)?;
        let (tx, rx) = oneshot::channel();
        chan.set_open_promise(tx);
        chan.mark_sent_open();
        debug!("opening channel {}: {:?}", id, typ);
        self.out.push(Msg::ChannelOpen {
            typ,
            sender_channel: id.0,
            initial_window_size: chan.local_window_size(),
            maximum_packet_size: chan.local_maximum_packet_size(),
        });
        self.channels.insert(id, chan);
        self.pump();
        Ok(rx)
    }

    /// Dispatch one parsed connection-layer message.
    ///
    /// Fails with `ProtocolViolation` when the message references a
    /// channel that is neither live nor in the post-close grace window,
    /// or addresses a channel whose open handshake has not finished.
    /// Violations *inside* a live channel tear that channel down
    /// without failing the multiplexer.
    pub fn receive(&mut self, msg: Msg) -> Result<(), Error> {
        let result = self.route(msg);
        self.pump();
        result
    }

    fn route(&mut self, msg: Msg) -> Result<(), Error> {
        match msg {
            Msg::ChannelOpen {
                typ,
                sender_channel,
                initial_window_size,
                maximum_packet_size,
            } => {
                self.handle_inbound_open(
                    typ,
                    sender_channel,
                    initial_window_size,
                    maximum_packet_size,
                );
                Ok(())
            }
            Msg::ChannelOpenConfirmation {
                recipient_channel,
                sender_channel,
                initial_window_size,
                maximum_packet_size,
            } => self.with_channel(recipient_channel, false, |chan, out| {
                chan.handle_open_confirmation(
                    sender_channel,
                    initial_window_size,
                    maximum_packet_size,
                    out,
                )
            }),
            Msg::ChannelOpenFailure {
                recipient_channel,
                reason,
                ..
            } => {
                let id = ChannelId(recipient_channel);
                if let Some(chan) = self.channels.get_mut(&id) {
                    let r = chan.handle_open_failure(reason);
                    self.channel_result(id, r);
                    Ok(())
                } else if self.grace.contains(&id) {
                    Ok(())
                } else {
                    warn!("open failure for unknown channel {}", id);
                    Err(Error::ProtocolViolation)
                }
            }
            Msg::ChannelWindowAdjust {
                recipient_channel,
                bytes_to_add,
            } => self.with_channel(recipient_channel, true, |chan, out| {
                chan.handle_window_adjust(bytes_to_add, out)
            }),
            Msg::ChannelData {
                recipient_channel,
                data,
            } => self.with_channel(recipient_channel, true, |chan, _| chan.handle_data(data)),
            Msg::ChannelExtendedData {
                recipient_channel,
                data_type_code,
                data,
            } => self.with_channel(recipient_channel, true, |chan, _| {
                chan.handle_extended_data(data_type_code, data)
            }),
            Msg::ChannelEof { recipient_channel } => {
                self.with_channel(recipient_channel, true, |chan, _| chan.handle_eof())
            }
            Msg::ChannelClose { recipient_channel } => {
                let id = ChannelId(recipient_channel);
                if let Some(chan) = self.channels.get_mut(&id) {
                    let r = chan.handle_close_received(&mut self.out);
                    self.channel_result(id, r);
                    Ok(())
                } else if self.grace.remove(&id) {
                    debug!("grace period over for channel {}", id);
                    Ok(())
                } else {
                    warn!("close for unknown channel {}", id);
                    Err(Error::ProtocolViolation)
                }
            }
            Msg::ChannelRequest {
                recipient_channel,
                request_type,
                want_reply,
                type_specific,
            } => self.with_channel(recipient_channel, true, |chan, _| {
                chan.handle_request(request_type, want_reply, type_specific)
            }),
            Msg::ChannelSuccess { recipient_channel } => {
                self.with_channel(recipient_channel, true, |chan, _| {
                    chan.handle_request_reply(true)
                })
            }
            Msg::ChannelFailure { recipient_channel } => {
                self.with_channel(recipient_channel, true, |chan, _| {
                    chan.handle_request_reply(false)
                })
            }
        }
    }

    /// End of a transport read burst: deliver batches to every channel
    /// that is ready for one.
    pub fn read_complete(&mut self) {
        let ids: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, chan)| chan.wants_delivery())
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(chan) = self.channels.get_mut(&id) {
                chan.deliver_batch(&mut self.out);
            }
            self.settle(id);
        }
        self.pump();
    }

    /// The transport disconnected. Every child closes with
    /// `TcpShutdown`; nothing more reaches the wire.
    pub fn parent_inactive(&mut self) {
        debug!("parent inactive, closing {} channels", self.channels.len());
        self.parent_active = false;
        let ids: Vec<ChannelId> = self.channels.keys().cloned().collect();
        for id in ids {
            if let Some(chan) = self.channels.get_mut(&id) {
                chan.force_close(Error::TcpShutdown, false, &mut self.out);
            }
            self.settle(id);
        }
        self.grace.clear();
        self.out.clear();
    }

    /// The transport handler detached: writes and flushes now fail
    /// with `IoOnClosedChannel`, channel creation with
    /// `ProtocolViolation`.
    pub fn parent_handler_removed(&mut self) {
        debug!("parent handler removed");
        self.delegate = None;
    }

    // ---- per-channel user operations ------------------------------

    /// Queue a write on a channel; `ext` is `None` for ordinary data,
    /// `Some(1)` for stderr. Nothing reaches the wire until
    /// [`flush`](Multiplexer::flush). The returned handle resolves when
    /// the last chunk of this write is emitted.
    pub fn write(
        &mut self,
        id: ChannelId,
        data: CryptoVec,
        ext: Option<u32>,
    ) -> Result<oneshot::Receiver<Result<(), Error>>, Error> {
        if self.delegate.is_none() {
            return Err(Error::IoOnClosedChannel);
        }
        let r = match self.channels.get_mut(&id) {
            Some(chan) => chan.write_op(data, ext),
            None => Err(Error::IoOnClosedChannel),
        };
        self.settle(id);
        self.pump();
        r
    }

    /// Emit a channel's queued writes, as far as its window allows.
    pub fn flush(&mut self, id: ChannelId) -> Result<(), Error> {
        if self.delegate.is_none() {
            return Err(Error::IoOnClosedChannel);
        }
        match self.channels.get_mut(&id) {
            Some(chan) => chan.flush_op(&mut self.out),
            None => return Err(Error::IoOnClosedChannel),
        }
        self.settle(id);
        self.pump();
        Ok(())
    }

    /// Request one delivery batch on a manually-read channel: events
    /// already buffered deliver now, otherwise the next read burst
    /// does.
    pub fn read(&mut self, id: ChannelId) -> Result<(), Error> {
        match self.channels.get_mut(&id) {
            Some(chan) => chan.read_op(&mut self.out),
            None => return Err(Error::IoOnClosedChannel),
        }
        self.settle(id);
        self.pump();
        Ok(())
    }

    /// Close a channel.
    ///
    /// `CloseMode::Output` sends EOF once pending writes are out and
    /// resolves then. `CloseMode::All` emits pending writes, then
    /// `ChannelClose`, and resolves when the peer's close completes the
    /// channel. A second full close fails with `AlreadyClosed`;
    /// `CloseMode::Input` with `OperationUnsupported`.
    pub fn close(
        &mut self,
        id: ChannelId,
        mode: CloseMode,
    ) -> Result<oneshot::Receiver<Result<(), Error>>, Error> {
        let r = match self.channels.get_mut(&id) {
            Some(chan) => chan.close_op(mode, &mut self.out),
            None => Err(Error::AlreadyClosed),
        };
        self.settle(id);
        self.pump();
        r
    }

    /// Send a channel request to the peer.
    pub fn send_request(
        &mut self,
        id: ChannelId,
        request_type: &str,
        want_reply: bool,
        data: CryptoVec,
    ) -> Result<(), Error> {
        if self.delegate.is_none() {
            return Err(Error::IoOnClosedChannel);
        }
        let r = match self.channels.get_mut(&id) {
            Some(chan) => chan.send_request_op(request_type, want_reply, data, &mut self.out),
            None => Err(Error::IoOnClosedChannel),
        };
        self.pump();
        r
    }

    /// Reply to the oldest channel request still owed a reply on this
    /// channel. Does nothing if no reply is owed.
    pub fn respond_request(&mut self, id: ChannelId, success: bool) -> Result<(), Error> {
        if self.delegate.is_none() {
            return Err(Error::IoOnClosedChannel);
        }
        let r = match self.channels.get_mut(&id) {
            Some(chan) => chan.respond_request_op(success, &mut self.out),
            None => Err(Error::IoOnClosedChannel),
        };
        self.pump();
        r
    }

    /// Whether more writes on the channel are advisable right now.
    pub fn is_writable(&self, id: ChannelId) -> bool {
        self.channels.get(&id).map(|c| c.is_writable()).unwrap_or(false)
    }

    /// Access a live channel, e.g. for its options.
    pub fn channel(&self, id: ChannelId) -> Option<&ChildChannel> {
        self.channels.get(&id)
    }

    /// Mutable access to a live channel, e.g. to flip its options.
    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut ChildChannel> {
        self.channels.get_mut(&id)
    }

    /// How many channels are live.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    // ---- internals ------------------------------------------------

    fn alloc_id(&mut self) -> ChannelId {
        loop {
            let id = ChannelId(self.next_id.0);
            self.next_id += Wrapping(1);
            if !self.channels.contains_key(&id) && !self.grace.contains(&id) {
                return id;
            }
        }
    }

    fn handle_inbound_open(
        &mut self,
        typ: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) {
        if self.inbound_initializer.is_none() {
            debug!("refusing inbound channel open: no initializer");
            self.out.push(Msg::ChannelOpenFailure {
                recipient_channel: sender_channel,
                reason: ChannelOpenFailure::AdministrativelyProhibited,
                description: "channel open not allowed".to_string(),
                language_tag: String::new(),
            });
            return;
        }
        let id = self.alloc_id();
        let mut chan = ChildChannel::new(id, typ, &self.config);
        let r = match self.inbound_initializer {
            Some(ref mut init) => init(&mut chan),
            None => unreachable!(),
        };
        match r {
            Ok(()) => {
                chan.accept_open(sender_channel, initial_window_size, maximum_packet_size);
                debug!("accepted inbound channel {} (peer {})", id, sender_channel);
                self.out.push(Msg::ChannelOpenConfirmation {
                    recipient_channel: sender_channel,
                    sender_channel: id.0,
                    initial_window_size: chan.local_window_size(),
                    maximum_packet_size: chan.local_maximum_packet_size(),
                });
                self.channels.insert(id, chan);
                if let Some(chan) = self.channels.get_mut(&id) {
                    chan.fire_channel_active(&mut self.out);
                }
                self.settle(id);
            }
            Err(err) => {
                debug!("inbound channel open refused by initializer: {:?}", err);
                self.out.push(Msg::ChannelOpenFailure {
                    recipient_channel: sender_channel,
                    reason: ChannelOpenFailure::ConnectFailed,
                    description: "channel open failed".to_string(),
                    language_tag: String::new(),
                });
                // The pipeline the initializer already built sees the
                // rejection; the channel is never added.
                let cause = Error::ChannelSetupRejected(ChannelOpenFailure::ConnectFailed);
                chan.force_close(cause, false, &mut self.out);
            }
        }
    }

    /// Look up the addressed channel and run `f` on it. `gate_opening`
    /// rejects messages that cannot legally address a channel whose
    /// open handshake is still pending.
    fn with_channel<F>(&mut self, raw: u32, gate_opening: bool, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut ChildChannel, &mut Vec<Msg>) -> Result<(), Error>,
    {
        let id = ChannelId(raw);
        if let Some(chan) = self.channels.get_mut(&id) {
            if gate_opening && chan.is_opening() {
                warn!("message for channel {} before its open finished", id);
                return Err(Error::ProtocolViolation);
            }
            let r = f(chan, &mut self.out);
            self.channel_result(id, r);
            Ok(())
        } else if self.grace.contains(&id) {
            trace!("dropping message for channel {} in grace period", id);
            Ok(())
        } else {
            warn!("message for unknown channel {}", id);
            Err(Error::ProtocolViolation)
        }
    }

    /// A per-channel violation closes that channel, and only that
    /// channel, and shields its ID until the peer acknowledges.
    fn channel_result(&mut self, id: ChannelId, r: Result<(), Error>) {
        match r {
            Ok(()) => self.settle(id),
            Err(e) => {
                warn!("protocol violation on channel {}: {:?}", id, e);
                if let Some(chan) = self.channels.get_mut(&id) {
                    chan.force_close(e, true, &mut self.out);
                }
                self.settle(id);
                self.grace.insert(id);
            }
        }
    }

    /// Deliver outstanding writability edges and reap the channel once
    /// it is terminal and its close notification has fired.
    fn settle(&mut self, id: ChannelId) {
        loop {
            let chan = match self.channels.get_mut(&id) {
                Some(chan) => chan,
                None => return,
            };
            if let Some(writable) = chan.writability_event() {
                chan.notify_writability(writable, &mut self.out);
                continue;
            }
            if chan.is_finalized() {
                debug!("removing channel {}", id);
                self.channels.remove(&id);
            }
            return;
        }
    }

    fn pump(&mut self) {
        if self.out.is_empty() {
            return;
        }
        match self.delegate {
            Some(ref mut delegate) => {
                for msg in self.out.drain(..) {
                    trace!("emitting {:?}", msg);
                    if let Err(e) = delegate.write_from_parent(msg) {
                        warn!("delegate write failed: {:?}", e);
                    }
                }
                delegate.flush_from_parent();
            }
            None => self.out.clear(),
        }
    }
}
