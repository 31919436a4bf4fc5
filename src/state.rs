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

//! Per-channel protocol state.
//!
//! Every inbound message kind is validated against the channel's
//! current state before it has any effect; every outbound transition
//! (EOF sent, close sent) is recorded here. The half-closed directions
//! are tracked as flags next to the lifecycle: a channel can have sent
//! EOF, received EOF, or both, while remaining live.

use crate::Error;

/// Where a channel is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    /// Created locally, nothing on the wire yet.
    Idle,
    /// Our `ChannelOpen` is out, waiting for the peer's verdict.
    Opening,
    /// Open handshake done, data may flow.
    Active,
    /// We sent `ChannelClose`, waiting for the peer's.
    LocalClosing,
    /// The peer sent `ChannelClose`, ours is on its way out.
    RemoteClosing,
    /// Both closes exchanged (or the channel was torn down).
    Closed,
}

/// What to do with an admissible inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Queue it for delivery to the user pipeline.
    Deliver,
    /// Accept it silently; the channel is past caring.
    Discard,
}

#[derive(Debug)]
pub(crate) struct ChannelStateMachine {
    lifecycle: Lifecycle,
    sent_eof: bool,
    recv_eof: bool,
}

impl ChannelStateMachine {
    pub fn new() -> ChannelStateMachine {
        ChannelStateMachine {
            lifecycle: Lifecycle::Idle,
            sent_eof: false,
            recv_eof: false,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn has_sent_eof(&self) -> bool {
        self.sent_eof
    }

    pub fn has_recv_eof(&self) -> bool {
        self.recv_eof
    }

    pub fn is_closing(&self) -> bool {
        match self.lifecycle {
            Lifecycle::LocalClosing | Lifecycle::RemoteClosing | Lifecycle::Closed => true,
            Lifecycle::Idle | Lifecycle::Opening | Lifecycle::Active => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle == Lifecycle::Closed
    }

    /// Our `ChannelOpen` went out.
    pub fn sent_open(&mut self) {
        debug_assert_eq!(self.lifecycle, Lifecycle::Idle);
        self.lifecycle = Lifecycle::Opening;
    }

    /// The peer opened this channel and we confirmed it.
    pub fn opened_by_peer(&mut self) {
        debug_assert_eq!(self.lifecycle, Lifecycle::Idle);
        self.lifecycle = Lifecycle::Active;
    }

    /// `ChannelOpenConfirmation` received. Only admissible while
    /// `Opening`; a confirmation of an already-confirmed channel is a
    /// protocol violation.
    pub fn recv_open_confirmation(&mut self) -> Result<(), Error> {
        match self.lifecycle {
            Lifecycle::Opening => {
                self.lifecycle = Lifecycle::Active;
                Ok(())
            }
            Lifecycle::Idle
            | Lifecycle::Active
            | Lifecycle::LocalClosing
            | Lifecycle::RemoteClosing
            | Lifecycle::Closed => Err(Error::ProtocolViolation),
        }
    }

    /// `ChannelOpenFailure` received.
    pub fn recv_open_failure(&mut self) -> Result<(), Error> {
        match self.lifecycle {
            Lifecycle::Opening => {
                self.lifecycle = Lifecycle::Closed;
                Ok(())
            }
            Lifecycle::Idle
            | Lifecycle::Active
            | Lifecycle::LocalClosing
            | Lifecycle::RemoteClosing
            | Lifecycle::Closed => Err(Error::ProtocolViolation),
        }
    }

    /// `ChannelData` or `ChannelExtendedData` received. Data after the
    /// peer's EOF is a violation; data racing our own close is dropped.
    pub fn recv_data(&self) -> Result<Disposition, Error> {
        match self.lifecycle {
            Lifecycle::Active => {
                if self.recv_eof {
                    Err(Error::ProtocolViolation)
                } else {
                    Ok(Disposition::Deliver)
                }
            }
            Lifecycle::LocalClosing => Ok(Disposition::Discard),
            Lifecycle::Idle
            | Lifecycle::Opening
            | Lifecycle::RemoteClosing
            | Lifecycle::Closed => Err(Error::ProtocolViolation),
        }
    }

    /// `ChannelEof` received. A second EOF is a violation.
    pub fn recv_eof(&mut self) -> Result<Disposition, Error> {
        match self.lifecycle {
            Lifecycle::Active => {
                if self.recv_eof {
                    Err(Error::ProtocolViolation)
                } else {
                    self.recv_eof = true;
                    Ok(Disposition::Deliver)
                }
            }
            Lifecycle::LocalClosing => Ok(Disposition::Discard),
            Lifecycle::Idle
            | Lifecycle::Opening
            | Lifecycle::RemoteClosing
            | Lifecycle::Closed => Err(Error::ProtocolViolation),
        }
    }

    /// `ChannelWindowAdjust` received.
    pub fn recv_window_adjust(&self) -> Result<(), Error> {
        match self.lifecycle {
            Lifecycle::Active | Lifecycle::LocalClosing => Ok(()),
            Lifecycle::Idle
            | Lifecycle::Opening
            | Lifecycle::RemoteClosing
            | Lifecycle::Closed => Err(Error::ProtocolViolation),
        }
    }

    /// `ChannelRequest` received.
    pub fn recv_request(&self) -> Result<Disposition, Error> {
        match self.lifecycle {
            Lifecycle::Active => Ok(Disposition::Deliver),
            Lifecycle::LocalClosing => Ok(Disposition::Discard),
            Lifecycle::Idle
            | Lifecycle::Opening
            | Lifecycle::RemoteClosing
            | Lifecycle::Closed => Err(Error::ProtocolViolation),
        }
    }

    /// `ChannelSuccess` or `ChannelFailure` received.
    pub fn recv_request_reply(&self) -> Result<Disposition, Error> {
        match self.lifecycle {
            Lifecycle::Active => Ok(Disposition::Deliver),
            Lifecycle::LocalClosing => Ok(Disposition::Discard),
            Lifecycle::Idle
            | Lifecycle::Opening
            | Lifecycle::RemoteClosing
            | Lifecycle::Closed => Err(Error::ProtocolViolation),
        }
    }

    /// `ChannelClose` received.
    pub fn recv_close(&mut self) -> Result<(), Error> {
        match self.lifecycle {
            Lifecycle::Active => {
                self.lifecycle = Lifecycle::RemoteClosing;
                Ok(())
            }
            Lifecycle::LocalClosing => {
                self.lifecycle = Lifecycle::Closed;
                Ok(())
            }
            Lifecycle::Idle
            | Lifecycle::Opening
            | Lifecycle::RemoteClosing
            | Lifecycle::Closed => Err(Error::ProtocolViolation),
        }
    }

    /// May user data still be queued for sending?
    pub fn can_send_data(&self) -> Result<(), Error> {
        match self.lifecycle {
            Lifecycle::Idle | Lifecycle::Opening | Lifecycle::Active => {
                if self.sent_eof {
                    Err(Error::OutputClosed)
                } else {
                    Ok(())
                }
            }
            Lifecycle::LocalClosing | Lifecycle::RemoteClosing | Lifecycle::Closed => {
                Err(Error::AlreadyClosed)
            }
        }
    }

    /// Our `ChannelEof` went out.
    pub fn mark_sent_eof(&mut self) {
        debug_assert!(!self.sent_eof);
        self.sent_eof = true;
    }

    /// Our `ChannelClose` went out.
    pub fn mark_sent_close(&mut self) {
        match self.lifecycle {
            Lifecycle::RemoteClosing => self.lifecycle = Lifecycle::Closed,
            _ => self.lifecycle = Lifecycle::LocalClosing,
        }
    }

    /// Teardown without protocol niceties (transport gone, or fatal
    /// channel error).
    pub fn force_closed(&mut self) {
        self.lifecycle = Lifecycle::Closed;
    }
}
