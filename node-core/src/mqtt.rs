//! Minimal MQTT 3.1.1 client codec.
//!
//! Covers exactly what a QoS 0 publisher needs: CONNECT, PUBLISH, PINGREQ and
//! DISCONNECT on the way out; CONNACK, PINGRESP and anything else (skipped) on
//! the way in. Decoding runs over a `winnow` partial stream so a frame split
//! across socket reads reports "need more" instead of an error.

use core::{fmt, time::Duration};

use heapless::Vec;
use winnow::binary::u8 as byte_parser;
use winnow::error::ErrMode;
use winnow::prelude::*;
use winnow::stream::{Partial, Stream};
use winnow::token::take;

use crate::clock::NodeInstant;

/// Largest frame the codec encodes or accepts.
pub const MAX_PACKET_LEN: usize = 256;

/// Outbound frame buffer.
pub type PacketBuffer = Vec<u8, MAX_PACKET_LEN>;

const PROTOCOL_NAME: &[u8] = b"MQTT";
const PROTOCOL_LEVEL: u8 = 4;
const CLEAN_SESSION: u8 = 0x02;

const CONNECT: u8 = 0x10;
const PUBLISH: u8 = 0x30;
const PINGREQ: u8 = 0xC0;
const DISCONNECT: u8 = 0xE0;

const CONNACK_TYPE: u8 = 2;
const PUBLISH_TYPE: u8 = 3;
const PINGRESP_TYPE: u8 = 13;

/// Encoding failures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncodeError {
    /// The frame does not fit [`MAX_PACKET_LEN`].
    BufferFull,
    /// A length-prefixed field exceeds 65535 bytes.
    FieldTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::BufferFull => write!(f, "frame exceeds {MAX_PACKET_LEN} bytes"),
            EncodeError::FieldTooLong => f.write_str("string field exceeds 65535 bytes"),
        }
    }
}

/// Decoding failures. Incomplete input is not an error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    Malformed,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("malformed MQTT frame")
    }
}

/// Inbound control packets the client cares about.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    ConnAck { session_present: bool, return_code: u8 },
    PingResp,
    /// Broker-originated publish; contents are ignored.
    Publish,
    /// Any other packet type, by its 4-bit type number.
    Other(u8),
}

/// Encodes a clean-session CONNECT for `client_id`.
///
/// # Errors
///
/// Fails when the client id is too long for the buffer.
pub fn encode_connect(
    client_id: &str,
    keepalive: Duration,
    buf: &mut PacketBuffer,
) -> Result<(), EncodeError> {
    let keepalive = u16::try_from(keepalive.as_secs()).unwrap_or(u16::MAX);
    let remaining = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2 + 2 + client_id.len();

    buf.clear();
    push(buf, &[CONNECT])?;
    push_remaining_length(buf, remaining)?;
    push_prefixed(buf, PROTOCOL_NAME)?;
    push(buf, &[PROTOCOL_LEVEL, CLEAN_SESSION])?;
    push(buf, &keepalive.to_be_bytes())?;
    push_prefixed(buf, client_id.as_bytes())
}

/// Encodes a QoS 0 PUBLISH.
///
/// # Errors
///
/// Fails when topic and payload do not fit the buffer.
pub fn encode_publish(
    topic: &str,
    payload: &[u8],
    buf: &mut PacketBuffer,
) -> Result<(), EncodeError> {
    let remaining = 2 + topic.len() + payload.len();

    buf.clear();
    push(buf, &[PUBLISH])?;
    push_remaining_length(buf, remaining)?;
    push_prefixed(buf, topic.as_bytes())?;
    push(buf, payload)
}

/// Encodes a PINGREQ.
///
/// # Errors
///
/// Never fails in practice; kept fallible for symmetry with the other encoders.
pub fn encode_pingreq(buf: &mut PacketBuffer) -> Result<(), EncodeError> {
    buf.clear();
    push(buf, &[PINGREQ, 0])
}

/// Encodes a DISCONNECT.
///
/// # Errors
///
/// Never fails in practice; kept fallible for symmetry with the other encoders.
pub fn encode_disconnect(buf: &mut PacketBuffer) -> Result<(), EncodeError> {
    buf.clear();
    push(buf, &[DISCONNECT, 0])
}

fn push(buf: &mut PacketBuffer, bytes: &[u8]) -> Result<(), EncodeError> {
    buf.extend_from_slice(bytes)
        .map_err(|_| EncodeError::BufferFull)?;
    Ok(())
}

fn push_prefixed(buf: &mut PacketBuffer, bytes: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(bytes.len()).map_err(|_| EncodeError::FieldTooLong)?;
    push(buf, &len.to_be_bytes())?;
    push(buf, bytes)
}

#[allow(clippy::cast_possible_truncation)]
fn push_remaining_length(buf: &mut PacketBuffer, mut len: usize) -> Result<(), EncodeError> {
    if len > MAX_PACKET_LEN {
        return Err(EncodeError::BufferFull);
    }
    loop {
        let mut digit = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            digit |= 0x80;
        }
        push(buf, &[digit])?;
        if len == 0 {
            return Ok(());
        }
    }
}

type Input<'a> = Partial<&'a [u8]>;

/// Decodes the first frame in `buffer`.
///
/// Returns the packet and the number of bytes it occupied, or `None` when the
/// buffer does not yet hold a complete frame.
///
/// # Errors
///
/// Returns [`DecodeError::Malformed`] for frames that can never become valid.
pub fn decode(buffer: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
    let mut input = Partial::new(buffer);
    match packet(&mut input) {
        Ok(packet) => Ok(Some((packet, buffer.len() - input.eof_offset()))),
        Err(ErrMode::Incomplete(_)) => Ok(None),
        Err(ErrMode::Backtrack(()) | ErrMode::Cut(())) => Err(DecodeError::Malformed),
    }
}

fn packet(input: &mut Input<'_>) -> ModalResult<Packet, ()> {
    let header = byte(input)?;
    let len = remaining_length(input)?;
    if len > MAX_PACKET_LEN {
        return Err(ErrMode::Cut(()));
    }
    let body = body(input, len)?;

    match header >> 4 {
        CONNACK_TYPE => match body {
            [flags, return_code] => Ok(Packet::ConnAck {
                session_present: flags & 0x01 != 0,
                return_code: *return_code,
            }),
            _ => Err(ErrMode::Cut(())),
        },
        PINGRESP_TYPE if body.is_empty() => Ok(Packet::PingResp),
        PINGRESP_TYPE => Err(ErrMode::Cut(())),
        PUBLISH_TYPE => Ok(Packet::Publish),
        other => Ok(Packet::Other(other)),
    }
}

fn byte(input: &mut Input<'_>) -> ModalResult<u8, ()> {
    byte_parser.parse_next(input)
}

fn body<'a>(input: &mut Input<'a>, len: usize) -> ModalResult<&'a [u8], ()> {
    take(len).parse_next(input)
}

fn remaining_length(input: &mut Input<'_>) -> ModalResult<usize, ()> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for _ in 0..4 {
        let digit = byte(input)?;
        value += usize::from(digit & 0x7F) * multiplier;
        if digit & 0x80 == 0 {
            return Ok(value);
        }
        multiplier *= 128;
    }
    Err(ErrMode::Cut(()))
}

/// What the session should do about keepalive at a given instant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeepAliveAction {
    Idle,
    SendPing,
    /// A ping went unanswered for a full interval; the session is dead.
    Expired,
}

/// Tracks traffic in both directions and decides when to ping.
#[derive(Copy, Clone, Debug)]
pub struct KeepAlive<I> {
    interval: Duration,
    last_sent: Option<I>,
    last_received: Option<I>,
    ping_sent_at: Option<I>,
}

impl<I: NodeInstant> KeepAlive<I> {
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            last_received: None,
            ping_sent_at: None,
        }
    }

    /// Starts tracking a fresh session at `now`.
    pub fn reset(&mut self, now: I) {
        self.last_sent = Some(now);
        self.last_received = Some(now);
        self.ping_sent_at = None;
    }

    pub fn on_sent(&mut self, now: I) {
        self.last_sent = Some(now);
    }

    /// Any inbound frame proves the broker is alive.
    pub fn on_received(&mut self, now: I) {
        self.last_received = Some(now);
        self.ping_sent_at = None;
    }

    pub fn on_ping_sent(&mut self, now: I) {
        self.ping_sent_at = Some(now);
        self.last_sent = Some(now);
    }

    #[must_use]
    pub const fn ping_outstanding(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    #[must_use]
    pub fn poll(&self, now: I) -> KeepAliveAction {
        let quiet = |since: Option<I>| {
            since.is_none_or(|at| now.saturating_duration_since(at) >= self.interval)
        };

        if let Some(sent) = self.ping_sent_at {
            if now.saturating_duration_since(sent) >= self.interval {
                return KeepAliveAction::Expired;
            }
            return KeepAliveAction::Idle;
        }

        if quiet(self.last_sent) || quiet(self.last_received) {
            KeepAliveAction::SendPing
        } else {
            KeepAliveAction::Idle
        }
    }
}
