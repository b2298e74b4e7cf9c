//! Framed binary wire format on the GPS link.
//!
//! ```text
//! frame (non-query) = header . i32(message type) . i32(payload len) . payload . tail
//! to-positioning header   = "\r\nCPTG\r\n"
//! from-positioning header = "\r\nGTCP\r\n"
//! query header            = "\r\n?????\r\n"   (no type/length/payload)
//! tail                    = "\r\nEOM\r\n"
//! ```
//!
//! The two integers are host byte order, as both ends have always written
//! them; running the endpoints on different architectures is unsupported.
//!
//! A frame whose declared payload length does not land exactly on the tail
//! offset is malformed; the deframer discards the span up to the tail and
//! resynchronizes on the next header.

use crate::common::scanbuf::find;

pub const HEADER_TO_GPS: &[u8] = b"\r\nCPTG\r\n";
pub const HEADER_FROM_GPS: &[u8] = b"\r\nGTCP\r\n";
pub const HEADER_QUERY: &[u8] = b"\r\n?????\r\n";
pub const TAIL: &[u8] = b"\r\nEOM\r\n";

const TYPE_LEN_BYTES: usize = 8;
const MAX_ASSEMBLY_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToGps,
    FromGps,
}

impl Direction {
    fn header(self) -> &'static [u8] {
        match self {
            Direction::ToGps => HEADER_TO_GPS,
            Direction::FromGps => HEADER_FROM_GPS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MsgType {
    None = 0,
    Query = 1,
    MeasAbortReq = 2,
    PosMeasReq = 3,
    PosMeasResp = 4,
}

impl MsgType {
    fn from_i32(v: i32) -> Option<MsgType> {
        Some(match v {
            0 => MsgType::None,
            1 => MsgType::Query,
            2 => MsgType::MeasAbortReq,
            3 => MsgType::PosMeasReq,
            4 => MsgType::PosMeasResp,
            _ => return None,
        })
    }
}

#[derive(Debug, PartialEq)]
pub enum DeframeEvent {
    Frame {
        direction: Direction,
        msg_type: MsgType,
        payload: Vec<u8>,
    },
    /// Liveness probe; recognized and acknowledged in the log only.
    Query,
    /// A malformed span was discarded (length mismatch or unknown type).
    Discarded { bytes: usize },
}

pub fn encode_frame(direction: Direction, msg_type: MsgType, payload: &[u8]) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(direction.header().len() + TYPE_LEN_BYTES + payload.len() + TAIL.len());
    out.extend_from_slice(direction.header());
    out.extend_from_slice(&(msg_type as i32).to_ne_bytes());
    out.extend_from_slice(&(payload.len() as i32).to_ne_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(TAIL);
    out
}

pub fn encode_query() -> Vec<u8> {
    HEADER_QUERY.to_vec()
}

/// Incremental deframer over the link's receive-assembly buffer.
#[derive(Default)]
pub struct Deframer {
    buf: Vec<u8>,
}

impl Deframer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Append incoming bytes and pull out every complete frame.
    pub fn push(&mut self, data: &[u8]) -> Vec<DeframeEvent> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();
        while let Some(event) = self.next_event() {
            events.push(event);
        }
        // a peer that never completes a frame cannot grow the buffer forever
        if self.buf.len() > MAX_ASSEMBLY_BYTES {
            let bytes = self.buf.len();
            self.buf.clear();
            events.push(DeframeEvent::Discarded { bytes });
        }
        events
    }

    fn next_event(&mut self) -> Option<DeframeEvent> {
        // locate the earliest direction header; the query header is its own
        // complete message
        let to_gps = find(&self.buf, HEADER_TO_GPS).map(|p| (p, Direction::ToGps));
        let from_gps = find(&self.buf, HEADER_FROM_GPS).map(|p| (p, Direction::FromGps));
        let header = match (to_gps, from_gps) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
            (a, b) => a.or(b),
        };
        let query = find(&self.buf, HEADER_QUERY);

        if let Some(q) = query {
            if header.is_none() || header.is_some_and(|(h, _)| q < h) {
                self.buf.drain(..q + HEADER_QUERY.len());
                return Some(DeframeEvent::Query);
            }
        }

        let (start, direction) = header?;
        if start > 0 {
            // noise before the header is dropped
            self.buf.drain(..start);
        }

        let hdr_len = HEADER_TO_GPS.len();
        if self.buf.len() < hdr_len + TYPE_LEN_BYTES {
            return None;
        }
        let raw_type = i32::from_ne_bytes(self.buf[hdr_len..hdr_len + 4].try_into().unwrap());
        let declared_len =
            i32::from_ne_bytes(self.buf[hdr_len + 4..hdr_len + 8].try_into().unwrap());
        let data_start = hdr_len + TYPE_LEN_BYTES;

        let tail = find(&self.buf[data_start..], TAIL).map(|p| data_start + p)?;

        let well_formed = declared_len >= 0
            && data_start + declared_len as usize == tail
            && MsgType::from_i32(raw_type).is_some();
        if !well_formed {
            // resynchronize: discard up to (not including) the tail marker,
            // which doubles as the next scan anchor
            let discarded = tail;
            self.buf.drain(..discarded);
            return Some(DeframeEvent::Discarded { bytes: discarded });
        }

        let msg_type = MsgType::from_i32(raw_type).unwrap();
        let payload = self.buf[data_start..tail].to_vec();
        self.buf.drain(..tail + TAIL.len());
        Some(DeframeEvent::Frame {
            direction,
            msg_type,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let payload = vec![0xAAu8; 40];
        let wire = encode_frame(Direction::ToGps, MsgType::PosMeasReq, &payload);
        let mut d = Deframer::new();
        let events = d.push(&wire);
        assert_eq!(
            events,
            vec![DeframeEvent::Frame {
                direction: Direction::ToGps,
                msg_type: MsgType::PosMeasReq,
                payload,
            }]
        );
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn empty_payload_frame() {
        let wire = encode_frame(Direction::ToGps, MsgType::MeasAbortReq, &[]);
        let mut d = Deframer::new();
        let events = d.push(&wire);
        assert!(matches!(
            events[0],
            DeframeEvent::Frame { msg_type: MsgType::MeasAbortReq, ref payload, .. } if payload.is_empty()
        ));
    }

    #[test]
    fn reassembles_across_chunks() {
        let wire = encode_frame(Direction::FromGps, MsgType::PosMeasResp, b"abcdef");
        let mut d = Deframer::new();
        let mut events = Vec::new();
        for chunk in wire.chunks(3) {
            events.extend(d.push(chunk));
        }
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            DeframeEvent::Frame { ref payload, .. } if payload == b"abcdef"
        ));
    }

    #[test]
    fn noise_before_header_is_dropped() {
        let mut wire = b"line noise...".to_vec();
        wire.extend_from_slice(&encode_frame(Direction::FromGps, MsgType::PosMeasResp, b"x"));
        let mut d = Deframer::new();
        let events = d.push(&wire);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DeframeEvent::Frame { .. }));
    }

    #[test]
    fn length_mismatch_resynchronizes() {
        // declare 10 payload bytes but provide 4
        let mut bad = Vec::new();
        bad.extend_from_slice(HEADER_TO_GPS);
        bad.extend_from_slice(&3i32.to_ne_bytes());
        bad.extend_from_slice(&10i32.to_ne_bytes());
        bad.extend_from_slice(b"oops");
        bad.extend_from_slice(TAIL);
        let good = encode_frame(Direction::ToGps, MsgType::PosMeasReq, b"fine");

        let mut d = Deframer::new();
        let mut events = d.push(&bad);
        events.extend(d.push(&good));
        assert!(matches!(events[0], DeframeEvent::Discarded { .. }));
        assert!(matches!(
            events.last().unwrap(),
            DeframeEvent::Frame { ref payload, .. } if payload == b"fine"
        ));
    }

    #[test]
    fn unknown_type_resynchronizes() {
        let mut bad = Vec::new();
        bad.extend_from_slice(HEADER_FROM_GPS);
        bad.extend_from_slice(&99i32.to_ne_bytes());
        bad.extend_from_slice(&0i32.to_ne_bytes());
        bad.extend_from_slice(TAIL);
        let mut d = Deframer::new();
        let events = d.push(&bad);
        assert!(matches!(events[0], DeframeEvent::Discarded { .. }));
    }

    #[test]
    fn query_header_recognized() {
        let mut wire = encode_query();
        wire.extend_from_slice(&encode_frame(Direction::ToGps, MsgType::MeasAbortReq, &[]));
        let mut d = Deframer::new();
        let events = d.push(&wire);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], DeframeEvent::Query);
    }
}
