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

//! One logical channel inside the multiplexer.
//!
//! A [`ChildChannel`] owns the protocol state machine and flow
//! controller of a single channel, the inbound delivery queue (read
//! gating), and the user-installed [`ChannelHandler`]. It never holds a
//! reference to the multiplexer: outbound messages are pushed onto an
//! outbox the multiplexer drains into its delegate.

use crate::flow::{Emission, FlowController, Promise};
use crate::msg::{ChannelType, Msg};
use crate::state::{ChannelStateMachine, Disposition, Lifecycle};
use crate::{ChannelId, ChannelOpenFailure, CloseMode, Config, Error};
use cryptovec::CryptoVec;
use futures::channel::oneshot;
use std::collections::VecDeque;

/// An inbound event waiting for a read signal.
enum Delivery {
    Data(CryptoVec),
    ExtendedData { code: u32, data: CryptoVec },
    Eof,
    Request {
        request_type: String,
        want_reply: bool,
        data: CryptoVec,
    },
    RequestReply { success: bool },
}

/// The user side of a channel.
///
/// Implementations are installed by a channel initializer and receive
/// every user-visible event of the channel's life. All methods have
/// default implementations, in the spirit of the handler traits of the
/// client and server sides of this library family: implement what you
/// need. The default `channel_request` rejects requests that want a
/// reply.
pub trait ChannelHandler {
    /// The open handshake finished and the channel may be used.
    fn channel_active(&mut self, cx: &mut ChannelContext) {
        let _ = cx;
    }

    /// A data payload arrived.
    fn data(&mut self, cx: &mut ChannelContext, data: CryptoVec) {
        let _ = (cx, data);
    }

    /// An extended-data payload arrived. `code` 1 is standard error;
    /// unknown codes are handed over verbatim.
    fn extended_data(&mut self, cx: &mut ChannelContext, code: u32, data: CryptoVec) {
        let _ = (cx, code, data);
    }

    /// The peer sent EOF and remote half-closure is allowed on this
    /// channel.
    fn eof(&mut self, cx: &mut ChannelContext) {
        let _ = cx;
    }

    /// A delivery batch just finished.
    fn read_complete(&mut self, cx: &mut ChannelContext) {
        let _ = cx;
    }

    /// The channel's writability toggled; check
    /// [`ChannelContext::is_writable`].
    fn writability_changed(&mut self, cx: &mut ChannelContext, writable: bool) {
        let _ = (cx, writable);
    }

    /// The peer sent a channel request. If `want_reply` is set, the
    /// peer is owed a [`ChannelContext::respond_request`] call, in
    /// order.
    fn channel_request(
        &mut self,
        cx: &mut ChannelContext,
        request_type: &str,
        want_reply: bool,
        data: CryptoVec,
    ) {
        let _ = (request_type, data);
        if want_reply {
            let _ = cx.respond_request(false);
        }
    }

    /// The peer replied to one of our channel requests.
    fn request_response(&mut self, cx: &mut ChannelContext, success: bool) {
        let _ = (cx, success);
    }

    /// Something went wrong on this channel. The channel closes right
    /// after this call.
    fn error(&mut self, cx: &mut ChannelContext, err: Error) {
        let _ = (cx, err);
    }

    /// The channel is gone. `cause` is `None` for an orderly close.
    fn channel_closed(&mut self, cx: &mut ChannelContext, cause: Option<Error>) {
        let _ = (cx, cause);
    }
}

/// What a [`ChannelHandler`] may do to its own channel from inside a
/// callback.
pub struct ChannelContext<'a> {
    pub(crate) chan: &'a mut ChildChannel,
    pub(crate) out: &'a mut Vec<Msg>,
}

impl<'a> ChannelContext<'a> {
    /// The local identifier of this channel.
    pub fn id(&self) -> ChannelId {
        self.chan.local_id
    }

    /// The type fixed at open time.
    pub fn channel_type(&self) -> &ChannelType {
        &self.chan.typ
    }

    /// Whether more writes are advisable right now.
    pub fn is_writable(&self) -> bool {
        self.chan.is_writable()
    }

    /// The peer's maximum packet size, once the open handshake has
    /// fixed it.
    pub fn peer_maximum_message_length(&self) -> Option<u32> {
        self.chan.peer_maximum_message_length()
    }

    /// See [`ChildChannel::set_auto_read`].
    pub fn set_auto_read(&mut self, auto_read: bool) {
        self.chan.set_auto_read(auto_read)
    }

    /// Whether batches deliver on every read-complete signal.
    pub fn auto_read(&self) -> bool {
        self.chan.auto_read()
    }

    /// See [`ChildChannel::set_allow_remote_half_closure`].
    pub fn set_allow_remote_half_closure(&mut self, allow: bool) {
        self.chan.set_allow_remote_half_closure(allow)
    }

    /// Whether the peer's EOF is surfaced instead of closing.
    pub fn allow_remote_half_closure(&self) -> bool {
        self.chan.allow_remote_half_closure()
    }

    /// Queue a write on this channel. `ext` is `None` for ordinary
    /// data, `Some(1)` for standard error. Nothing reaches the wire
    /// until [`flush`](ChannelContext::flush).
    pub fn write(
        &mut self,
        data: CryptoVec,
        ext: Option<u32>,
    ) -> Result<oneshot::Receiver<Result<(), Error>>, Error> {
        self.chan.write_op(data, ext)
    }

    /// Emit everything queued, as far as the window allows.
    pub fn flush(&mut self) {
        self.chan.flush_op(self.out)
    }

    /// Request one delivery batch (manual-read mode).
    pub fn read(&mut self) {
        self.chan.read_op(self.out)
    }

    /// Close this channel. See [`Multiplexer::close`](crate::Multiplexer::close).
    pub fn close(&mut self, mode: CloseMode) -> Result<(), Error> {
        self.chan.close_op(mode, self.out).map(|_| ())
    }

    /// Send a channel request to the peer.
    pub fn send_request(
        &mut self,
        request_type: &str,
        want_reply: bool,
        data: CryptoVec,
    ) -> Result<(), Error> {
        self.chan.send_request_op(request_type, want_reply, data, self.out)
    }

    /// Reply to the oldest channel request still owed a reply. Does
    /// nothing if no reply is owed.
    pub fn respond_request(&mut self, success: bool) -> Result<(), Error> {
        self.chan.respond_request_op(success, self.out)
    }
}

/// One logical channel. Owned by the multiplexer; reachable from user
/// code through the initializer and through [`ChannelContext`].
pub struct ChildChannel {
    local_id: ChannelId,
    peer_id: Option<u32>,
    typ: ChannelType,
    state: ChannelStateMachine,
    flow: FlowController,
    local_max_packet: u32,

    deliveries: VecDeque<Delivery>,
    auto_read: bool,
    allow_half_closure: bool,
    read_requested: bool,
    delivering: bool,

    handler: Option<Box<dyn ChannelHandler>>,
    open_promise: Option<oneshot::Sender<Result<ChannelId, Error>>>,
    close_promise: Option<Promise>,
    close_requested: bool,
    output_closed: bool,
    /// Writability last reported to the handler.
    notified_writable: bool,
    closed_notified: bool,
    reply_obligations: VecDeque<()>,
}

impl ChildChannel {
    pub(crate) fn new(local_id: ChannelId, typ: ChannelType, config: &Config) -> ChildChannel {
        ChildChannel {
            local_id,
            peer_id: None,
            typ,
            state: ChannelStateMachine::new(),
            flow: FlowController::new(config.window_size),
            local_max_packet: config.maximum_packet_size,
            deliveries: VecDeque::new(),
            auto_read: true,
            allow_half_closure: false,
            read_requested: false,
            delivering: false,
            handler: None,
            open_promise: None,
            close_promise: None,
            close_requested: false,
            output_closed: false,
            notified_writable: true,
            closed_notified: false,
            reply_obligations: VecDeque::new(),
        }
    }

    /// The local identifier of this channel.
    pub fn id(&self) -> ChannelId {
        self.local_id
    }

    /// The type fixed at open time.
    pub fn channel_type(&self) -> &ChannelType {
        &self.typ
    }

    /// Install the user handler. Must be called from the initializer;
    /// a channel without a handler cannot be activated.
    pub fn set_handler(&mut self, handler: Box<dyn ChannelHandler>) {
        self.handler = Some(handler);
    }

    /// Deliver inbound batches on every read-complete signal (the
    /// default), or only when [`read`](ChannelContext::read) asks.
    pub fn set_auto_read(&mut self, auto_read: bool) {
        self.auto_read = auto_read;
    }

    /// Whether batches deliver on every read-complete signal.
    pub fn auto_read(&self) -> bool {
        self.auto_read
    }

    /// When false (the default), a peer EOF closes the channel; when
    /// true, it is surfaced as [`ChannelHandler::eof`] and the channel
    /// stays half-open.
    pub fn set_allow_remote_half_closure(&mut self, allow: bool) {
        self.allow_half_closure = allow;
    }

    /// Whether the peer's EOF is surfaced instead of closing.
    pub fn allow_remote_half_closure(&self) -> bool {
        self.allow_half_closure
    }

    /// Override the receive window advertised for this channel. Only
    /// meaningful from the initializer, before anything is on the wire.
    pub fn set_initial_window_size(&mut self, window: u32) {
        debug_assert_eq!(self.state.lifecycle(), Lifecycle::Idle);
        self.flow.set_local_window(window);
    }

    /// Override the maximum packet size advertised for this channel.
    /// Only meaningful from the initializer.
    pub fn set_maximum_packet_size(&mut self, max: u32) {
        debug_assert_eq!(self.state.lifecycle(), Lifecycle::Idle);
        self.local_max_packet = max;
    }

    /// The peer's maximum packet size, once the open handshake has
    /// fixed it.
    pub fn peer_maximum_message_length(&self) -> Option<u32> {
        self.flow.peer_max_packet()
    }

    /// Whether more writes are advisable right now.
    pub fn is_writable(&self) -> bool {
        self.flow.is_writable()
    }

    pub(crate) fn local_window_size(&self) -> u32 {
        self.flow.local_initial_window()
    }

    pub(crate) fn local_maximum_packet_size(&self) -> u32 {
        self.local_max_packet
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.state.is_closed() && self.closed_notified
    }

    /// Still waiting for the peer's verdict on our open.
    pub(crate) fn is_opening(&self) -> bool {
        match self.state.lifecycle() {
            Lifecycle::Idle | Lifecycle::Opening => true,
            _ => false,
        }
    }

    pub(crate) fn set_open_promise(
        &mut self,
        promise: oneshot::Sender<Result<ChannelId, Error>>,
    ) {
        self.open_promise = Some(promise);
    }

    pub(crate) fn mark_sent_open(&mut self) {
        self.state.sent_open();
    }

    /// Bind a channel the peer opened: its parameters are known right
    /// away.
    pub(crate) fn accept_open(&mut self, peer_id: u32, peer_window: u32, peer_max_packet: u32) {
        self.state.opened_by_peer();
        self.peer_id = Some(peer_id);
        self.flow.connect(peer_window, peer_max_packet);
        self.notified_writable = self.flow.is_writable();
    }

    pub(crate) fn fire_channel_active(&mut self, out: &mut Vec<Msg>) {
        self.with_handler(out, |h, cx| h.channel_active(cx));
    }

    // ---- user-side operations -------------------------------------

    pub(crate) fn write_op(
        &mut self,
        data: CryptoVec,
        ext: Option<u32>,
    ) -> Result<oneshot::Receiver<Result<(), Error>>, Error> {
        if self.output_closed {
            return Err(Error::OutputClosed);
        }
        self.state.can_send_data()?;
        let (tx, rx) = oneshot::channel();
        self.flow.write(data, ext, Some(tx));
        Ok(rx)
    }

    pub(crate) fn flush_op(&mut self, out: &mut Vec<Msg>) {
        self.flow.flush_mark();
        self.drain(out);
    }

    pub(crate) fn read_op(&mut self, out: &mut Vec<Msg>) {
        if self.delivering || self.deliveries.is_empty() {
            // Nothing buffered yet: deliver on the next read-complete.
            self.read_requested = true;
            return;
        }
        self.deliver_batch(out);
    }

    pub(crate) fn close_op(
        &mut self,
        mode: CloseMode,
        out: &mut Vec<Msg>,
    ) -> Result<oneshot::Receiver<Result<(), Error>>, Error> {
        match mode {
            CloseMode::Input => Err(Error::OperationUnsupported),
            CloseMode::Output => {
                if self.output_closed {
                    return Err(Error::OutputClosed);
                }
                self.state.can_send_data()?;
                self.output_closed = true;
                let (tx, rx) = oneshot::channel();
                self.flow.queue_eof(Some(tx));
                self.flow.flush_mark();
                self.drain(out);
                Ok(rx)
            }
            CloseMode::All => {
                if self.close_requested || self.state.is_closed() {
                    return Err(Error::AlreadyClosed);
                }
                debug!("closing channel {}", self.local_id);
                self.close_requested = true;
                self.output_closed = true;
                let (tx, rx) = oneshot::channel();
                self.close_promise = Some(tx);
                match self.state.lifecycle() {
                    // Queued until the open handshake resolves.
                    Lifecycle::Idle | Lifecycle::Opening => (),
                    Lifecycle::Active => {
                        self.flow.queue_close();
                        self.flow.flush_mark();
                        self.drain(out);
                    }
                    // Teardown is already in flight.
                    Lifecycle::LocalClosing
                    | Lifecycle::RemoteClosing
                    | Lifecycle::Closed => (),
                }
                Ok(rx)
            }
        }
    }

    pub(crate) fn send_request_op(
        &mut self,
        request_type: &str,
        want_reply: bool,
        data: CryptoVec,
        out: &mut Vec<Msg>,
    ) -> Result<(), Error> {
        match self.state.lifecycle() {
            Lifecycle::Active => (),
            Lifecycle::LocalClosing | Lifecycle::RemoteClosing | Lifecycle::Closed => {
                return Err(Error::AlreadyClosed)
            }
            Lifecycle::Idle | Lifecycle::Opening => return Err(Error::ProtocolViolation),
        }
        let peer = match self.peer_id {
            Some(p) => p,
            None => return Err(Error::ProtocolViolation),
        };
        out.push(Msg::ChannelRequest {
            recipient_channel: peer,
            request_type: request_type.to_string(),
            want_reply,
            type_specific: data,
        });
        Ok(())
    }

    pub(crate) fn respond_request_op(
        &mut self,
        success: bool,
        out: &mut Vec<Msg>,
    ) -> Result<(), Error> {
        if self.reply_obligations.pop_front().is_none() {
            // No reply owed; nothing to say.
            return Ok(());
        }
        if self.state.is_closed() {
            return Ok(());
        }
        let peer = match self.peer_id {
            Some(p) => p,
            None => return Ok(()),
        };
        out.push(if success {
            Msg::ChannelSuccess { recipient_channel: peer }
        } else {
            Msg::ChannelFailure { recipient_channel: peer }
        });
        Ok(())
    }

    // ---- inbound message handling ---------------------------------

    pub(crate) fn handle_open_confirmation(
        &mut self,
        peer_id: u32,
        peer_window: u32,
        peer_max_packet: u32,
        out: &mut Vec<Msg>,
    ) -> Result<(), Error> {
        self.state.recv_open_confirmation()?;
        debug!(
            "channel {} confirmed: peer {}, window {}, max packet {}",
            self.local_id, peer_id, peer_window, peer_max_packet
        );
        self.peer_id = Some(peer_id);
        self.flow.connect(peer_window, peer_max_packet);
        self.notified_writable = self.flow.is_writable();
        if let Some(p) = self.open_promise.take() {
            let _ = p.send(Ok(self.local_id));
        }
        self.fire_channel_active(out);
        if self.close_requested {
            // The user closed while the open was pending: the close
            // goes out now, behind anything already queued.
            self.flow.queue_close();
            self.flow.flush_mark();
        }
        self.drain(out);
        Ok(())
    }

    pub(crate) fn handle_open_failure(&mut self, reason: ChannelOpenFailure) -> Result<(), Error> {
        self.state.recv_open_failure()?;
        debug!("channel {} rejected by peer: {:?}", self.local_id, reason);
        let err = Error::ChannelSetupRejected(reason);
        if let Some(p) = self.open_promise.take() {
            let _ = p.send(Err(err));
        }
        if let Some(p) = self.close_promise.take() {
            let _ = p.send(Err(err));
        }
        self.flow.fail_pending(err);
        // The channel never became active; there is no pipeline to
        // notify.
        self.closed_notified = true;
        Ok(())
    }

    pub(crate) fn handle_data(&mut self, data: CryptoVec) -> Result<(), Error> {
        let disposition = self.state.recv_data()?;
        self.flow.accept(data.len())?;
        if let Disposition::Deliver = disposition {
            self.deliveries.push_back(Delivery::Data(data));
        }
        Ok(())
    }

    pub(crate) fn handle_extended_data(&mut self, code: u32, data: CryptoVec) -> Result<(), Error> {
        let disposition = self.state.recv_data()?;
        self.flow.accept(data.len())?;
        if let Disposition::Deliver = disposition {
            self.deliveries.push_back(Delivery::ExtendedData { code, data });
        }
        Ok(())
    }

    pub(crate) fn handle_eof(&mut self) -> Result<(), Error> {
        if let Disposition::Deliver = self.state.recv_eof()? {
            self.deliveries.push_back(Delivery::Eof);
        }
        Ok(())
    }

    pub(crate) fn handle_window_adjust(&mut self, n: u32, out: &mut Vec<Msg>) -> Result<(), Error> {
        self.state.recv_window_adjust()?;
        self.flow.window_adjust(n)?;
        trace!("channel {}: +{} window", self.local_id, n);
        self.drain(out);
        Ok(())
    }

    pub(crate) fn handle_request(
        &mut self,
        request_type: String,
        want_reply: bool,
        data: CryptoVec,
    ) -> Result<(), Error> {
        if let Disposition::Deliver = self.state.recv_request()? {
            self.deliveries.push_back(Delivery::Request {
                request_type,
                want_reply,
                data,
            });
        }
        Ok(())
    }

    pub(crate) fn handle_request_reply(&mut self, success: bool) -> Result<(), Error> {
        if let Disposition::Deliver = self.state.recv_request_reply()? {
            self.deliveries.push_back(Delivery::RequestReply { success });
        }
        Ok(())
    }

    /// The peer closed the channel. Everything still buffered is
    /// delivered first (data, then EOF), then the close notification,
    /// all in this dispatch.
    pub(crate) fn handle_close_received(&mut self, out: &mut Vec<Msg>) -> Result<(), Error> {
        self.state.recv_close()?;
        self.deliver_batch(out);
        if self.state.lifecycle() == Lifecycle::RemoteClosing {
            // Writes that never made it out cannot be sent any more.
            self.flow.fail_pending(Error::AlreadyClosed);
            self.output_closed = true;
            self.state.mark_sent_close();
            if let Some(peer) = self.peer_id {
                out.push(Msg::ChannelClose { recipient_channel: peer });
            }
        }
        self.finish_close(None, out);
        Ok(())
    }

    // ---- teardown -------------------------------------------------

    /// Slam the channel shut: fail every pending promise with `cause`,
    /// surface the error, notify the close. `emit_close` is false when
    /// the transport is already gone.
    pub(crate) fn force_close(&mut self, cause: Error, emit_close: bool, out: &mut Vec<Msg>) {
        if self.is_finalized() {
            return;
        }
        debug!("channel {} torn down: {:?}", self.local_id, cause);
        if let Some(p) = self.open_promise.take() {
            let _ = p.send(Err(cause));
        }
        self.flow.fail_pending(cause);
        self.deliveries.clear();
        self.output_closed = true;
        self.close_requested = true;
        let close_already_sent = self.state.lifecycle() == Lifecycle::LocalClosing;
        let was_closed = self.state.is_closed();
        self.state.force_closed();
        if emit_close && !close_already_sent && !was_closed {
            if let Some(peer) = self.peer_id {
                out.push(Msg::ChannelClose { recipient_channel: peer });
            }
        }
        self.with_handler(out, |h, cx| h.error(cx, cause));
        self.finish_close(Some(cause), out);
    }

    fn finish_close(&mut self, cause: Option<Error>, out: &mut Vec<Msg>) {
        if !self.state.is_closed() {
            return;
        }
        if !self.closed_notified {
            self.closed_notified = true;
            self.with_handler(out, |h, cx| h.channel_closed(cx, cause));
        }
        if let Some(p) = self.close_promise.take() {
            let _ = p.send(match cause {
                Some(e) => Err(e),
                None => Ok(()),
            });
        }
    }

    // ---- delivery -------------------------------------------------

    pub(crate) fn wants_delivery(&self) -> bool {
        !self.deliveries.is_empty() && (self.auto_read || self.read_requested)
    }

    /// Deliver exactly the events buffered at this moment; events
    /// arriving during the callbacks wait for the next batch.
    pub(crate) fn deliver_batch(&mut self, out: &mut Vec<Msg>) {
        if self.delivering || self.handler.is_none() {
            return;
        }
        let n = self.deliveries.len();
        if n == 0 {
            return;
        }
        self.delivering = true;
        self.read_requested = false;
        for _ in 0..n {
            let ev = match self.deliveries.pop_front() {
                Some(ev) => ev,
                None => break,
            };
            self.dispatch(ev, out);
        }
        if !(self.close_requested || self.state.is_closing()) {
            if let Some(delta) = self.flow.replenish() {
                if let Some(peer) = self.peer_id {
                    trace!("channel {}: granting {} window", self.local_id, delta);
                    out.push(Msg::ChannelWindowAdjust {
                        recipient_channel: peer,
                        bytes_to_add: delta,
                    });
                }
            }
        }
        self.with_handler(out, |h, cx| h.read_complete(cx));
        self.delivering = false;
    }

    fn dispatch(&mut self, ev: Delivery, out: &mut Vec<Msg>) {
        match ev {
            Delivery::Data(data) => {
                self.with_handler(out, |h, cx| h.data(cx, data));
            }
            Delivery::ExtendedData { code, data } => {
                self.with_handler(out, |h, cx| h.extended_data(cx, code, data));
            }
            Delivery::Eof => {
                if self.allow_half_closure {
                    self.with_handler(out, |h, cx| h.eof(cx));
                } else {
                    debug!(
                        "channel {}: EOF without remote half-closure, closing",
                        self.local_id
                    );
                    let _ = self.close_op(CloseMode::All, out);
                }
            }
            Delivery::Request {
                request_type,
                want_reply,
                data,
            } => {
                if want_reply {
                    self.reply_obligations.push_back(());
                }
                self.with_handler(out, |h, cx| {
                    h.channel_request(cx, &request_type, want_reply, data)
                });
            }
            Delivery::RequestReply { success } => {
                self.with_handler(out, |h, cx| h.request_response(cx, success));
            }
        }
    }

    /// Pop the handler out, run `f` with a context borrowing the
    /// channel, put the handler back. Re-entrant calls see no handler
    /// and do nothing.
    fn with_handler<R>(
        &mut self,
        out: &mut Vec<Msg>,
        f: impl FnOnce(&mut dyn ChannelHandler, &mut ChannelContext) -> R,
    ) -> Option<R> {
        let mut handler = self.handler.take()?;
        let r = {
            let mut cx = ChannelContext { chan: self, out };
            f(&mut *handler, &mut cx)
        };
        self.handler = Some(handler);
        Some(r)
    }

    /// A writability edge not yet reported to the handler, if any.
    pub(crate) fn writability_event(&self) -> Option<bool> {
        let now = self.flow.is_writable();
        if now != self.notified_writable {
            Some(now)
        } else {
            None
        }
    }

    pub(crate) fn notify_writability(&mut self, writable: bool, out: &mut Vec<Msg>) {
        self.notified_writable = writable;
        self.with_handler(out, |h, cx| h.writability_changed(cx, writable));
    }

    // ---- outbound queue drain -------------------------------------

    /// Emit as much of the flushed queue as the window allows.
    fn drain(&mut self, out: &mut Vec<Msg>) {
        if self.state.lifecycle() != Lifecycle::Active {
            return;
        }
        let peer = match self.peer_id {
            Some(p) => p,
            None => return,
        };
        while let Some(emission) = self.flow.pop_emittable() {
            match emission {
                Emission::Data { data, ext, promise } => {
                    match ext {
                        Some(code) => out.push(Msg::ChannelExtendedData {
                            recipient_channel: peer,
                            data_type_code: code,
                            data,
                        }),
                        None => out.push(Msg::ChannelData {
                            recipient_channel: peer,
                            data,
                        }),
                    }
                    if let Some(p) = promise {
                        let _ = p.send(Ok(()));
                    }
                }
                Emission::Eof { promise } => {
                    self.state.mark_sent_eof();
                    out.push(Msg::ChannelEof { recipient_channel: peer });
                    if let Some(p) = promise {
                        let _ = p.send(Ok(()));
                    }
                }
                Emission::Close => {
                    self.state.mark_sent_close();
                    out.push(Msg::ChannelClose { recipient_channel: peer });
                    break;
                }
            }
        }
    }
}
