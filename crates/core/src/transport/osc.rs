//! OSC 1.0 blob transport.
//!
//! A state update is a single OSC message: the topic as address pattern, the
//! type tag string `",b"` and one blob argument holding the encoded state.
//! The decoder understands the core argument types and bundles so that it can
//! share a port with other OSC traffic; anything other than a lone blob is
//! ignored by the listener.

use std::net::{SocketAddr, UdpSocket};

use tracing::{debug, info, trace};

use super::udp::{self, UdpListener};
use super::{DatagramSender, Listener, MessageHandler, Transport};
use crate::{DistributionConfig, Result, StateSyncError, TransportKind};

const BUNDLE_TAG: &str = "#bundle";
/// Bundles nested deeper than this are rejected.
const MAX_BUNDLE_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int(i32),
    Float(f32),
    Str(String),
    Blob(Vec<u8>),
}

impl OscArg {
    fn tag(&self) -> char {
        match self {
            OscArg::Int(_) => 'i',
            OscArg::Float(_) => 'f',
            OscArg::Str(_) => 's',
            OscArg::Blob(_) => 'b',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    /// Type tags without the leading comma, e.g. `"b"`.
    pub fn type_tags(&self) -> String {
        self.args.iter().map(OscArg::tag).collect()
    }

    /// The blob payload when the message carries exactly one blob.
    pub fn single_blob(&self) -> Option<&[u8]> {
        match self.args.as_slice() {
            [OscArg::Blob(bytes)] => Some(bytes),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_string(&mut out, &self.address);
        let tags = format!(",{}", self.type_tags());
        put_string(&mut out, &tags);
        for arg in &self.args {
            match arg {
                OscArg::Int(value) => out.extend_from_slice(&value.to_be_bytes()),
                OscArg::Float(value) => out.extend_from_slice(&value.to_be_bytes()),
                OscArg::Str(value) => put_string(&mut out, value),
                OscArg::Blob(bytes) => put_blob(&mut out, bytes),
            }
        }
        out
    }
}

const fn padded(len: usize) -> usize {
    (len + 3) & !3
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    let start = out.len();
    out.extend_from_slice(value.as_bytes());
    out.resize(start + padded(value.len() + 1), 0);
}

fn put_blob(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
    let start = out.len();
    out.extend_from_slice(bytes);
    out.resize(start + padded(bytes.len()), 0);
}

/// Encodes a message carrying a single blob argument.
pub fn encode_blob_message(address: &str, blob: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(blob_message_len(address, blob.len()));
    put_string(&mut out, address);
    put_string(&mut out, ",b");
    put_blob(&mut out, blob);
    out
}

/// Wire size of a single-blob message.
pub const fn blob_message_len(address: &str, blob_len: usize) -> usize {
    padded(address.len() + 1) + 4 + 4 + padded(blob_len)
}

/// Decodes a datagram into the messages it carries, flattening bundles.
pub fn decode_packet(bytes: &[u8]) -> Result<Vec<OscMessage>> {
    let mut messages = Vec::new();
    decode_into(bytes, 0, &mut messages)?;
    Ok(messages)
}

fn decode_into(bytes: &[u8], depth: usize, messages: &mut Vec<OscMessage>) -> Result<()> {
    let mut cursor = Cursor::new(bytes);
    let head = cursor.string()?;
    if head != BUNDLE_TAG {
        messages.push(decode_message_body(head, &mut cursor)?);
        return Ok(());
    }
    if depth >= MAX_BUNDLE_DEPTH {
        return Err(StateSyncError::Codec("bundle nesting too deep"));
    }

    // Timetag; delivery is immediate regardless of what it asks for.
    cursor.take(8)?;
    while cursor.remaining() > 0 {
        let len = cursor.i32()?;
        let len = usize::try_from(len).map_err(|_| StateSyncError::Codec("negative bundle element size"))?;
        decode_into(cursor.take(len)?, depth + 1, messages)?;
    }
    Ok(())
}

fn decode_message_body(address: String, cursor: &mut Cursor<'_>) -> Result<OscMessage> {
    if !address.starts_with('/') {
        return Err(StateSyncError::Codec("address pattern must start with '/'"));
    }
    let tags = cursor.string()?;
    let tags = tags
        .strip_prefix(',')
        .ok_or(StateSyncError::Codec("type tag string must start with ','"))?;

    let mut args = Vec::with_capacity(tags.len());
    for tag in tags.chars() {
        let arg = match tag {
            'i' => OscArg::Int(cursor.i32()?),
            'f' => OscArg::Float(f32::from_bits(cursor.i32()? as u32)),
            's' => OscArg::Str(cursor.string()?),
            'b' => {
                let len = usize::try_from(cursor.i32()?)
                    .map_err(|_| StateSyncError::Codec("negative blob size"))?;
                let blob = cursor.take(len)?.to_vec();
                cursor.take(padded(len) - len)?;
                OscArg::Blob(blob)
            }
            _ => return Err(StateSyncError::Codec("unsupported OSC type tag")),
        };
        args.push(arg);
    }
    Ok(OscMessage { address, args })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(StateSyncError::Codec("packet truncated"))?;
        let bytes: &'a [u8] = self.bytes;
        self.offset = end;
        Ok(&bytes[end - len..end])
    }

    fn i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self) -> Result<String> {
        let bytes: &'a [u8] = self.bytes;
        let rest = &bytes[self.offset..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(StateSyncError::Codec("unterminated string"))?;
        let text = std::str::from_utf8(&rest[..nul])
            .map_err(|_| StateSyncError::Codec("string is not valid UTF-8"))?
            .to_string();
        self.take(padded(nul + 1))?;
        Ok(text)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OscTransport;

impl Transport for OscTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Osc
    }

    fn payload_capacity(&self, max_packet_size: u16, topic: &str) -> usize {
        let overhead = blob_message_len(topic, 0);
        (max_packet_size as usize).saturating_sub(overhead) & !3
    }

    fn open_sender(&self, config: &DistributionConfig) -> Result<Box<dyn DatagramSender>> {
        let (socket, target) = udp::open_sender(config)?;
        Ok(Box::new(OscSender { socket, target }))
    }

    fn open_listener(
        &self,
        config: &DistributionConfig,
        mut handler: MessageHandler,
    ) -> Result<Box<dyn Listener>> {
        let socket = udp::bind_listener(config)?;
        let listener = UdpListener::spawn(socket, "osc-listener", move |datagram| {
            match decode_packet(datagram) {
                Ok(messages) => {
                    for message in messages {
                        match message.single_blob() {
                            Some(blob) => handler(&message.address, blob),
                            None => trace!(
                                address = %message.address,
                                tags = %message.type_tags(),
                                "ignoring non-blob OSC message"
                            ),
                        }
                    }
                }
                Err(err) => debug!(error = %err, len = datagram.len(), "dropping malformed OSC packet"),
            }
        })?;
        info!(address = %config.address, port = config.port, "opened OSC listener");
        Ok(Box::new(listener))
    }
}

struct OscSender {
    socket: UdpSocket,
    target: SocketAddr,
}

impl DatagramSender for OscSender {
    fn send(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        let packet = encode_blob_message(topic, payload);
        self.socket.send_to(&packet, self.target)?;
        Ok(())
    }
}
