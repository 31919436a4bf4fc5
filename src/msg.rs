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

//! Parsed messages of the SSH connection layer
//! ([RFC 4254](https://tools.ietf.org/html/rfc4254), section 5).
//!
//! The transport side parses incoming packets into [`Msg`] values and
//! feeds them to the multiplexer; the multiplexer emits [`Msg`] values
//! for the transport to serialize. No wire format lives in this crate.

use crate::ChannelOpenFailure;
use cryptovec::CryptoVec;

/// The extended-data type code for standard error
/// ([RFC 4254, section 5.2](https://tools.ietf.org/html/rfc4254#section-5.2)).
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// The type of a channel, fixed at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// An interactive session.
    Session,
    /// A locally-initiated TCP/IP forwarding.
    DirectTcpIp {
        /// Host the peer should connect to.
        host_to_connect: String,
        /// Port the peer should connect to.
        port_to_connect: u32,
        /// Address the connection originated from.
        originator_address: String,
        /// Port the connection originated from.
        originator_port: u32,
    },
    /// A connection coming in on a remotely-forwarded port.
    ForwardedTcpIp {
        /// The address that was listening.
        connected_address: String,
        /// The port that was listening.
        connected_port: u32,
        /// Address the connection originated from.
        originator_address: String,
        /// Port the connection originated from.
        originator_port: u32,
    },
}

/// One parsed message of the connection layer.
///
/// `recipient_channel` is always the channel number *as the receiving
/// side knows it*: messages we receive carry our local IDs, messages we
/// emit carry the peer's.
pub enum Msg {
    /// `SSH_MSG_CHANNEL_OPEN`.
    ChannelOpen {
        /// The type of channel being opened.
        typ: ChannelType,
        /// The opener's channel number.
        sender_channel: u32,
        /// How many bytes the opener is prepared to receive.
        initial_window_size: u32,
        /// Largest data payload the opener accepts.
        maximum_packet_size: u32,
    },
    /// `SSH_MSG_CHANNEL_OPEN_CONFIRMATION`.
    ChannelOpenConfirmation {
        /// The opener's channel number.
        recipient_channel: u32,
        /// The confirmer's channel number.
        sender_channel: u32,
        /// How many bytes the confirmer is prepared to receive.
        initial_window_size: u32,
        /// Largest data payload the confirmer accepts.
        maximum_packet_size: u32,
    },
    /// `SSH_MSG_CHANNEL_OPEN_FAILURE`.
    ChannelOpenFailure {
        /// The opener's channel number.
        recipient_channel: u32,
        /// Why the open was rejected.
        reason: ChannelOpenFailure,
        /// Human-readable description.
        description: String,
        /// RFC 3066 language tag.
        language_tag: String,
    },
    /// `SSH_MSG_CHANNEL_WINDOW_ADJUST`.
    ChannelWindowAdjust {
        /// The channel the adjustment applies to.
        recipient_channel: u32,
        /// How many bytes to add to the window.
        bytes_to_add: u32,
    },
    /// `SSH_MSG_CHANNEL_DATA`.
    ChannelData {
        /// The channel the payload belongs to.
        recipient_channel: u32,
        /// The payload.
        data: CryptoVec,
    },
    /// `SSH_MSG_CHANNEL_EXTENDED_DATA`.
    ChannelExtendedData {
        /// The channel the payload belongs to.
        recipient_channel: u32,
        /// The stream the payload belongs to; `1` is standard error,
        /// other codes are passed through verbatim.
        data_type_code: u32,
        /// The payload.
        data: CryptoVec,
    },
    /// `SSH_MSG_CHANNEL_EOF`.
    ChannelEof {
        /// The channel whose sending side is done.
        recipient_channel: u32,
    },
    /// `SSH_MSG_CHANNEL_CLOSE`.
    ChannelClose {
        /// The channel being closed.
        recipient_channel: u32,
    },
    /// `SSH_MSG_CHANNEL_REQUEST`.
    ChannelRequest {
        /// The channel the request applies to.
        recipient_channel: u32,
        /// The request type, e.g. `"exec"` or `"pty-req"`.
        request_type: String,
        /// Whether the sender expects a success/failure reply.
        want_reply: bool,
        /// Request-specific payload, passed through verbatim.
        type_specific: CryptoVec,
    },
    /// `SSH_MSG_CHANNEL_SUCCESS`.
    ChannelSuccess {
        /// The channel whose request succeeded.
        recipient_channel: u32,
    },
    /// `SSH_MSG_CHANNEL_FAILURE`.
    ChannelFailure {
        /// The channel whose request failed.
        recipient_channel: u32,
    },
}

impl Msg {
    /// The recipient channel number, for messages that address an
    /// existing channel. `ChannelOpen` addresses no channel and returns
    /// `None`.
    pub fn recipient(&self) -> Option<u32> {
        match *self {
            Msg::ChannelOpen { .. } => None,
            Msg::ChannelOpenConfirmation { recipient_channel, .. }
            | Msg::ChannelOpenFailure { recipient_channel, .. }
            | Msg::ChannelWindowAdjust { recipient_channel, .. }
            | Msg::ChannelData { recipient_channel, .. }
            | Msg::ChannelExtendedData { recipient_channel, .. }
            | Msg::ChannelEof { recipient_channel }
            | Msg::ChannelClose { recipient_channel }
            | Msg::ChannelRequest { recipient_channel, .. }
            | Msg::ChannelSuccess { recipient_channel }
            | Msg::ChannelFailure { recipient_channel } => Some(recipient_channel),
        }
    }
}

// Payloads are elided down to their length: channel data is not for the
// logs.
impl std::fmt::Debug for Msg {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Msg::ChannelOpen { ref typ, sender_channel, initial_window_size, maximum_packet_size } => f
                .debug_struct("ChannelOpen")
                .field("typ", typ)
                .field("sender_channel", &sender_channel)
                .field("initial_window_size", &initial_window_size)
                .field("maximum_packet_size", &maximum_packet_size)
                .finish(),
            Msg::ChannelOpenConfirmation {
                recipient_channel,
                sender_channel,
                initial_window_size,
                maximum_packet_size,
            } => f
                .debug_struct("ChannelOpenConfirmation")
                .field("recipient_channel", &recipient_channel)
                .field("sender_channel", &sender_channel)
                .field("initial_window_size", &initial_window_size)
                .field("maximum_packet_size", &maximum_packet_size)
                .finish(),
            Msg::ChannelOpenFailure { recipient_channel, reason, ref description, .. } => f
                .debug_struct("ChannelOpenFailure")
                .field("recipient_channel", &recipient_channel)
                .field("reason", &reason)
                .field("description", description)
                .finish(),
            Msg::ChannelWindowAdjust { recipient_channel, bytes_to_add } => f
                .debug_struct("ChannelWindowAdjust")
                .field("recipient_channel", &recipient_channel)
                .field("bytes_to_add", &bytes_to_add)
                .finish(),
            Msg::ChannelData { recipient_channel, ref data } => f
                .debug_struct("ChannelData")
                .field("recipient_channel", &recipient_channel)
                .field("len", &data.len())
                .finish(),
            Msg::ChannelExtendedData { recipient_channel, data_type_code, ref data } => f
                .debug_struct("ChannelExtendedData")
                .field("recipient_channel", &recipient_channel)
                .field("data_type_code", &data_type_code)
                .field("len", &data.len())
                .finish(),
            Msg::ChannelEof { recipient_channel } => f
                .debug_struct("ChannelEof")
                .field("recipient_channel", &recipient_channel)
                .finish(),
            Msg::ChannelClose { recipient_channel } => f
                .debug_struct("ChannelClose")
                .field("recipient_channel", &recipient_channel)
                .finish(),
            Msg::ChannelRequest { recipient_channel, ref request_type, want_reply, ref type_specific } => f
                .debug_struct("ChannelRequest")
                .field("recipient_channel", &recipient_channel)
                .field("request_type", request_type)
                .field("want_reply", &want_reply)
                .field("len", &type_specific.len())
                .finish(),
            Msg::ChannelSuccess { recipient_channel } => f
                .debug_struct("ChannelSuccess")
                .field("recipient_channel", &recipient_channel)
                .finish(),
            Msg::ChannelFailure { recipient_channel } => f
                .debug_struct("ChannelFailure")
                .field("recipient_channel", &recipient_channel)
                .finish(),
        }
    }
}
