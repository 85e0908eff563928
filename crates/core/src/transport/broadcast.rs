//! Lightweight one-to-many datagram transport.
//!
//! Each payload is sent as a numbered frame. A frame larger than one packet is
//! split into fragments, each carrying this header (little-endian):
//!
//! ```text
//! ┌───────┬─────────────┬───────────┬──────────┬───────────┬───────────┬───────────┬───────┬──────┐
//! │ magic │ session u32 │ frame u32 │ part u16 │ parts u16 │ total u32 │ topic len │ topic │ data │
//! │ SSB1  │             │           │          │           │           │ u8        │       │      │
//! └───────┴─────────────┴───────────┴──────────┴───────────┴───────────┴───────────┴───────┴──────┘
//! ```
//!
//! Every sender picks a random session id when it is opened and numbers its
//! frames from 0. Receivers only ever assemble the newest frame they have seen
//! from the current session; fragments of older frames are dropped and a newer
//! frame evicts an incomplete one. A fragment from another session restarts
//! reassembly, so a restarted sender is followed immediately.

use std::net::{SocketAddr, UdpSocket};

use tracing::{debug, info, trace};

use super::udp::{self, UdpListener};
use super::{DatagramSender, Listener, MessageHandler, Transport};
use crate::{DistributionConfig, Result, StateSyncError, TransportKind};

const MAGIC: &[u8; 4] = b"SSB1";
const FIXED_HEADER_LEN: usize = 4 + 4 + 4 + 2 + 2 + 4 + 1;
/// Frames this far behind the newest one are treated as late arrivals. Anything
/// further back is taken to be a wrapped counter and accepted.
const STALE_WINDOW: u32 = 64;

pub fn header_len(topic: &str) -> usize {
    FIXED_HEADER_LEN + topic.len()
}

/// Splits `payload` into datagrams no larger than `max_packet_size`.
pub fn encode_frame(
    session: u32,
    frame: u32,
    topic: &str,
    payload: &[u8],
    max_packet_size: u16,
) -> Result<Vec<Vec<u8>>> {
    let topic_len =
        u8::try_from(topic.len()).map_err(|_| StateSyncError::Codec("topic longer than 255 bytes"))?;
    let total = u32::try_from(payload.len()).map_err(|_| StateSyncError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    let chunk = (max_packet_size as usize).saturating_sub(header_len(topic));
    let capacity = chunk * u16::MAX as usize;
    if chunk == 0 || payload.len() > capacity {
        return Err(StateSyncError::PayloadTooLarge {
            size: payload.len(),
            max: capacity,
        });
    }

    let parts = payload.len().div_ceil(chunk).max(1);
    let mut packets = Vec::with_capacity(parts);
    for part in 0..parts {
        let data = payload
            .get(part * chunk..((part + 1) * chunk).min(payload.len()))
            .unwrap_or_default();
        let mut packet = Vec::with_capacity(header_len(topic) + data.len());
        packet.extend_from_slice(MAGIC);
        packet.extend_from_slice(&session.to_le_bytes());
        packet.extend_from_slice(&frame.to_le_bytes());
        packet.extend_from_slice(&(part as u16).to_le_bytes());
        packet.extend_from_slice(&(parts as u16).to_le_bytes());
        packet.extend_from_slice(&total.to_le_bytes());
        packet.push(topic_len);
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(data);
        packets.push(packet);
    }
    Ok(packets)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub session: u32,
    pub frame: u32,
    pub part: u16,
    pub parts: u16,
    pub total_len: u32,
    pub topic: &'a str,
    pub data: &'a [u8],
}

pub fn decode_fragment(packet: &[u8]) -> Result<Fragment<'_>> {
    if packet.len() < FIXED_HEADER_LEN || &packet[..4] != MAGIC {
        return Err(StateSyncError::Codec("not a broadcast state fragment"));
    }
    let u16_at = |at: usize| u16::from_le_bytes([packet[at], packet[at + 1]]);
    let u32_at = |at: usize| {
        u32::from_le_bytes([packet[at], packet[at + 1], packet[at + 2], packet[at + 3]])
    };

    let session = u32_at(4);
    let frame = u32_at(8);
    let part = u16_at(12);
    let parts = u16_at(14);
    let total_len = u32_at(16);
    let topic_end = FIXED_HEADER_LEN + packet[20] as usize;
    let topic = packet
        .get(FIXED_HEADER_LEN..topic_end)
        .ok_or(StateSyncError::Codec("fragment truncated inside topic"))?;
    let topic =
        std::str::from_utf8(topic).map_err(|_| StateSyncError::Codec("topic is not valid UTF-8"))?;
    let data = &packet[topic_end..];

    if parts == 0 || part >= parts {
        return Err(StateSyncError::Codec("fragment index out of range"));
    }
    if data.len() > total_len as usize {
        return Err(StateSyncError::Codec("fragment larger than its frame"));
    }

    Ok(Fragment {
        session,
        frame,
        part,
        parts,
        total_len,
        topic,
        data,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Age {
    Same,
    Newer,
    Stale,
}

fn age(frame: u32, reference: u32) -> Age {
    let behind = reference.wrapping_sub(frame);
    if behind == 0 {
        Age::Same
    } else if behind <= STALE_WINDOW {
        Age::Stale
    } else {
        Age::Newer
    }
}

#[derive(Debug)]
struct PartialFrame {
    frame: u32,
    topic: String,
    total_len: usize,
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl PartialFrame {
    fn new(fragment: &Fragment<'_>) -> Self {
        Self {
            frame: fragment.frame,
            topic: fragment.topic.to_string(),
            total_len: fragment.total_len as usize,
            chunks: vec![None; fragment.parts as usize],
            received: 0,
        }
    }

    fn matches(&self, fragment: &Fragment<'_>) -> bool {
        self.topic == fragment.topic
            && self.total_len == fragment.total_len as usize
            && self.chunks.len() == fragment.parts as usize
    }
}

/// Rebuilds frames from fragments, keeping only the newest frame in flight.
#[derive(Debug, Default)]
pub struct Reassembler {
    session: Option<u32>,
    pending: Option<PartialFrame>,
    last_delivered: Option<u32>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one fragment. Returns `(topic, payload)` once a frame completes.
    pub fn push(&mut self, fragment: Fragment<'_>) -> Option<(String, Vec<u8>)> {
        if self.session != Some(fragment.session) {
            if let Some(previous) = self.session {
                debug!(previous, session = fragment.session, "broadcast sender changed session");
            }
            self.session = Some(fragment.session);
            self.pending = None;
            self.last_delivered = None;
        }

        if let Some(delivered) = self.last_delivered {
            if age(fragment.frame, delivered) != Age::Newer {
                trace!(frame = fragment.frame, delivered, "dropping fragment of delivered frame");
                return None;
            }
        }

        match self.pending.as_ref().map(|p| age(fragment.frame, p.frame)) {
            Some(Age::Stale) => {
                trace!(frame = fragment.frame, "dropping stale fragment");
                return None;
            }
            Some(Age::Newer) => {
                if let Some(evicted) = self.pending.take() {
                    debug!(
                        frame = evicted.frame,
                        received = evicted.received,
                        parts = evicted.chunks.len(),
                        "discarding incomplete frame"
                    );
                }
            }
            Some(Age::Same) | None => {}
        }

        let pending = self.pending.get_or_insert_with(|| PartialFrame::new(&fragment));
        if !pending.matches(&fragment) {
            debug!(frame = fragment.frame, "fragment disagrees with its frame header, dropping");
            return None;
        }

        let slot = &mut pending.chunks[fragment.part as usize];
        if slot.is_none() {
            *slot = Some(fragment.data.to_vec());
            pending.received += 1;
        }
        if pending.received < pending.chunks.len() {
            return None;
        }

        let complete = self.pending.take()?;
        let payload: Vec<u8> = complete.chunks.into_iter().flatten().flatten().collect();
        if payload.len() != complete.total_len {
            debug!(
                frame = complete.frame,
                expected = complete.total_len,
                actual = payload.len(),
                "reassembled frame has wrong length, dropping"
            );
            return None;
        }
        self.last_delivered = Some(complete.frame);
        Some((complete.topic, payload))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastTransport;

impl Transport for BroadcastTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Broadcast
    }

    fn payload_capacity(&self, max_packet_size: u16, topic: &str) -> usize {
        (max_packet_size as usize).saturating_sub(header_len(topic)) * u16::MAX as usize
    }

    fn open_sender(&self, config: &DistributionConfig) -> Result<Box<dyn DatagramSender>> {
        let (socket, target) = udp::open_sender(config)?;
        Ok(Box::new(BroadcastSender {
            socket,
            target,
            max_packet_size: config.max_packet_size,
            session: rand::random(),
            next_frame: 0,
        }))
    }

    fn open_listener(
        &self,
        config: &DistributionConfig,
        mut handler: MessageHandler,
    ) -> Result<Box<dyn Listener>> {
        let socket = udp::bind_listener(config)?;
        let mut reassembler = Reassembler::new();
        let listener = UdpListener::spawn(socket, "broadcast-listener", move |datagram| {
            match decode_fragment(datagram) {
                Ok(fragment) => {
                    if let Some((topic, payload)) = reassembler.push(fragment) {
                        handler(&topic, &payload);
                    }
                }
                Err(err) => debug!(error = %err, len = datagram.len(), "dropping malformed fragment"),
            }
        })?;
        info!(address = %config.address, port = config.port, "opened broadcast listener");
        Ok(Box::new(listener))
    }
}

struct BroadcastSender {
    socket: UdpSocket,
    target: SocketAddr,
    max_packet_size: u16,
    session: u32,
    next_frame: u32,
}

impl DatagramSender for BroadcastSender {
    fn send(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        let frame = self.next_frame;
        self.next_frame = self.next_frame.wrapping_add(1);
        for packet in encode_frame(self.session, frame, topic, payload, self.max_packet_size)? {
            self.socket.send_to(&packet, self.target)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: u32 = 0x5e55_1000;

    fn fragments(frame: u32, payload: &[u8], max: u16) -> Vec<Vec<u8>> {
        encode_frame(SESSION, frame, "/_state", payload, max).unwrap()
    }

    #[test]
    fn small_payload_is_one_fragment() {
        let packets = fragments(7, &[1, 2, 3], 1400);
        assert_eq!(packets.len(), 1);

        let fragment = decode_fragment(&packets[0]).unwrap();
        assert_eq!(fragment.session, SESSION);
        assert_eq!(fragment.frame, 7);
        assert_eq!(fragment.parts, 1);
        assert_eq!(fragment.topic, "/_state");
        assert_eq!(fragment.data, &[1, 2, 3]);
    }

    #[test]
    fn reassembles_out_of_order_fragments() {
        let payload: Vec<u8> = (0..100).collect();
        let max = (header_len("/_state") + 30) as u16;
        let mut packets = fragments(1, &payload, max);
        assert_eq!(packets.len(), 4);
        assert!(packets.iter().all(|p| p.len() <= max as usize));
        packets.reverse();

        let mut reassembler = Reassembler::new();
        let mut delivered = None;
        for packet in &packets {
            delivered = reassembler.push(decode_fragment(packet).unwrap());
        }
        assert_eq!(delivered, Some(("/_state".to_string(), payload)));
    }

    #[test]
    fn newer_frame_evicts_incomplete_one() {
        let max = (header_len("/_state") + 4) as u16;
        let old = fragments(1, &[1; 8], max);
        let new = fragments(2, &[2; 8], max);
        let mut reassembler = Reassembler::new();

        assert_eq!(reassembler.push(decode_fragment(&old[0]).unwrap()), None);
        assert_eq!(reassembler.push(decode_fragment(&new[0]).unwrap()), None);
        // The rest of the old frame can no longer complete it.
        assert_eq!(reassembler.push(decode_fragment(&old[1]).unwrap()), None);
        let delivered = reassembler.push(decode_fragment(&new[1]).unwrap());
        assert_eq!(delivered.map(|(_, payload)| payload), Some(vec![2; 8]));
    }

    #[test]
    fn drops_frames_older_than_the_last_delivery() {
        let mut reassembler = Reassembler::new();
        let newer = fragments(10, &[10], 1400);
        let older = fragments(9, &[9], 1400);

        assert!(reassembler.push(decode_fragment(&newer[0]).unwrap()).is_some());
        assert!(reassembler.push(decode_fragment(&older[0]).unwrap()).is_none());
        assert!(reassembler.push(decode_fragment(&newer[0]).unwrap()).is_none());
    }

    #[test]
    fn frames_far_behind_are_taken_as_a_wrapped_counter() {
        let mut reassembler = Reassembler::new();
        let before_wrap = fragments(5_000, &[1], 1400);
        let after_wrap = fragments(0, &[2], 1400);

        assert!(reassembler.push(decode_fragment(&before_wrap[0]).unwrap()).is_some());
        let delivered = reassembler.push(decode_fragment(&after_wrap[0]).unwrap());
        assert_eq!(delivered.map(|(_, payload)| payload), Some(vec![2]));
    }

    #[test]
    fn new_session_is_followed_from_its_first_frame() {
        let mut reassembler = Reassembler::new();
        for frame in 0..30 {
            assert!(reassembler
                .push(decode_fragment(&fragments(frame, &[1], 1400)[0]).unwrap())
                .is_some());
        }

        let restarted = SESSION + 1;
        for frame in 0..40u32 {
            let packet = encode_frame(restarted, frame, "/_state", &[frame as u8], 1400).unwrap();
            let delivered = reassembler.push(decode_fragment(&packet[0]).unwrap());
            assert_eq!(delivered.map(|(_, payload)| payload), Some(vec![frame as u8]));
        }
    }

    #[test]
    fn frame_numbers_wrap() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler
            .push(decode_fragment(&fragments(u32::MAX, &[1], 1400)[0]).unwrap())
            .is_some());
        assert!(reassembler
            .push(decode_fragment(&fragments(0, &[2], 1400)[0]).unwrap())
            .is_some());
    }

    #[test]
    fn rejects_garbage_and_bad_indices() {
        assert!(decode_fragment(b"nope").is_err());

        let mut packet = fragments(0, &[1, 2], 1400).remove(0);
        packet[12] = 3; // part 3 of 1
        assert!(decode_fragment(&packet).is_err());
    }

    #[test]
    fn refuses_packets_too_small_for_the_header() {
        let err = encode_frame(SESSION, 0, "/_state", &[1], 10).unwrap_err();
        assert!(matches!(err, StateSyncError::PayloadTooLarge { .. }));
    }
}
