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

#![deny(trivial_casts,
        unstable_features,
        unused_import_braces)]

//! Connection-layer channel multiplexer for SSH.
//!
//! This crate implements the channel layer of the SSH connection
//! protocol ([RFC 4254](https://tools.ietf.org/html/rfc4254)): the part
//! that, sitting on top of a single encrypted and authenticated
//! transport, carries many independent logical channels (interactive
//! sessions, direct and forwarded TCP/IP tunnels) over one ordered
//! message stream.
//!
//! It deliberately does *not* talk to the network. The transport side
//! (key exchange, encryption, packet framing) hands already-parsed
//! [`Msg`] values to [`Multiplexer::receive`], and receives
//! to-be-serialized [`Msg`] values back through the [`MuxDelegate`] it
//! supplies. Everything in between is handled here: the per-channel
//! open handshake, windowed flow control, read gating, EOF/close
//! sequencing and failure isolation.
//!
//! # Using the multiplexer
//!
//! Channels are used through *handlers*, i.e. types implementing
//! [`ChannelHandler`], in the same spirit as the handler traits of the
//! rest of this library family. A handler is installed on a channel by
//! its *initializer*, the closure passed to
//! [`Multiplexer::create_child_channel`] (for locally-opened channels)
//! or registered with [`Multiplexer::set_inbound_initializer`] (for
//! channels the peer opens).
//!
//! ```no_run
//! use sshmux::*;
//!
//! struct Transport;
//! impl MuxDelegate for Transport {
//!     fn write_from_parent(&mut self, _msg: Msg) -> Result<(), Error> {
//!         // serialize and queue on the wire.
//!         Ok(())
//!     }
//!     fn flush_from_parent(&mut self) {}
//! }
//!
//! struct Shell;
//! impl ChannelHandler for Shell {
//!     fn data(&mut self, _cx: &mut ChannelContext, data: CryptoVec) {
//!         println!("{:?}", &data[..]);
//!     }
//! }
//!
//! fn main() {
//!     let mut mux = Multiplexer::new(Config::default(), Transport);
//!     let pending = mux
//!         .create_child_channel(ChannelType::Session, |chan| {
//!             chan.set_handler(Box::new(Shell));
//!             Ok(())
//!         })
//!         .unwrap();
//!     // Feed parsed transport messages into `mux.receive(...)`, then
//!     // signal the end of each read burst with `mux.read_complete()`.
//!     // `pending` resolves once the peer confirms or rejects the open.
//!     let _ = pending;
//! }
//! ```
//!
//! # Concurrency model
//!
//! The multiplexer is single-threaded and run-to-completion: every
//! method runs synchronously on the caller's thread, there are no locks
//! and no internal suspension points. The only asynchronous surface is
//! the set of completion handles (open, write, close) returned to the
//! caller, which resolve when the corresponding protocol event arrives.
//! Callers on another thread must first hop onto the executor that owns
//! the multiplexer; `&mut self` makes this contract hard to get wrong.

#[macro_use]
extern crate log;
extern crate cryptovec;
extern crate futures;

pub use cryptovec::CryptoVec;

mod msg;
mod state;
mod flow;
mod channel;
mod mux;

pub use msg::{ChannelType, Msg, EXTENDED_DATA_STDERR};
pub use channel::{ChannelContext, ChannelHandler, ChildChannel};
pub use mux::{Multiplexer, MuxDelegate};

/// Default initial window size advertised on newly-opened channels.
pub const DEFAULT_WINDOW_SIZE: u32 = 1 << 24;

/// Default maximum packet size advertised on newly-opened channels.
pub const DEFAULT_MAXIMUM_PACKET_SIZE: u32 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The identifier of a channel.
pub struct ChannelId(pub(crate) u32);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

impl ChannelOpenFailure {
    /// Decode a reason code received from the peer.
    pub fn from_u32(x: u32) -> Option<ChannelOpenFailure> {
        match x {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }

    /// The wire representation of this reason.
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// How much of a channel a close request applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Full bidirectional close.
    All,
    /// Half-close: promise to send no more data, by sending EOF.
    Output,
    /// Half-closing the input side is not part of the SSH protocol;
    /// requesting it fails with `OperationUnsupported`.
    Input,
}

/// Parameters of new channels.
#[derive(Debug, Clone)]
pub struct Config {
    /// The initial receive window advertised when opening or accepting
    /// a channel.
    pub window_size: u32,
    /// The maximum packet size advertised when opening or accepting a
    /// channel.
    pub maximum_packet_size: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            window_size: DEFAULT_WINDOW_SIZE,
            maximum_packet_size: DEFAULT_MAXIMUM_PACKET_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Errors.
pub enum Error {
    /// The peer sent a message that is malformed, references an unknown
    /// channel, or is not admissible in the channel's current state.
    ProtocolViolation,

    /// Opening a channel was rejected, at either end.
    ChannelSetupRejected(ChannelOpenFailure),

    /// The transport went away; fatal to every channel of the
    /// multiplexer.
    TcpShutdown,

    /// Write or flush after the multiplexer has lost its transport
    /// handler.
    IoOnClosedChannel,

    /// Write after the output side was closed with EOF.
    OutputClosed,

    /// The requested operation is not supported, e.g. half-closing the
    /// input side of a channel.
    OperationUnsupported,

    /// Close requested on a channel that is already terminal.
    AlreadyClosed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Error::ProtocolViolation => write!(f, "Protocol violation"),
            Error::ChannelSetupRejected(reason) => {
                write!(f, "Channel setup rejected (reason {})", reason.code())
            }
            Error::TcpShutdown => write!(f, "Transport disconnected"),
            Error::IoOnClosedChannel => write!(f, "I/O on closed channel"),
            Error::OutputClosed => write!(f, "Write after EOF"),
            Error::OperationUnsupported => write!(f, "Operation unsupported"),
            Error::AlreadyClosed => write!(f, "Channel already closed"),
        }
    }
}

impl std::error::Error for Error {}
