//! AT-response scanner.
//!
//! Converts the modem's unbounded byte stream into discrete events: command
//! acknowledgments (OK/ERROR class) and unsolicited +CPOSR location-request
//! notifications. The stream has no inherent message boundaries, partial
//! reads are the norm, and unsolicited data interleaves with command
//! responses, so every decision is by earliest byte offset over the current
//! buffer.
//!
//! Terminator quirks reproduced here are empirically derived modem behavior,
//! not up for simplification:
//! - `RING\r\n` counts as an OK-class terminator at RING's offset.
//! - A lone Ctrl-Z acknowledges like OK; a lone Esc fails like ERROR.
//! - The `+CPOSR:` marker only counts when preceded by CRLF (or sitting at
//!   the very start of the buffer) and only when no terminator precedes it.

use crate::common::scanbuf::{find, find_byte, ScanBuf};

pub const CTRL_Z: u8 = 0x1A;
pub const ESC: u8 = 0x1B;

pub const OK_TERMINATOR: &[u8] = b"OK\r\n";
pub const ERROR_TERMINATOR: &[u8] = b"ERROR\r\n";
pub const RING_TERMINATOR: &[u8] = b"RING\r\n";
pub const UNSOL_MARKER: &[u8] = b"+CPOSR:";

const UNSOL_END_CRLF2: &[u8] = b"\r\n\r\n";
const UNSOL_END_PROMPT: &[u8] = b">\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckClass {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// A terminator was recognized. `line` is the whitespace-stripped
    /// content that preceded it (possibly empty).
    Ack { class: AckClass, line: Vec<u8> },
    /// An unsolicited notification was recognized; `xml` is the stripped
    /// payload after the marker's colon.
    Unsolicited { xml: Vec<u8> },
}

/// Offsets of every candidate marker in the buffer.
struct Marks {
    ok: Option<usize>,
    error: Option<usize>,
    ctrl_z: Option<usize>,
    esc: Option<usize>,
    ring: Option<usize>,
    unsol: Option<usize>,
}

fn scan_marks(buf: &[u8]) -> Marks {
    Marks {
        ok: find(buf, OK_TERMINATOR),
        error: find(buf, ERROR_TERMINATOR),
        ctrl_z: find_byte(buf, CTRL_Z),
        esc: find_byte(buf, ESC),
        ring: find(buf, RING_TERMINATOR),
        unsol: find_unsol_marker(buf),
    }
}

/// `+CPOSR:` immediately preceded by CRLF; an occurrence too close to the
/// buffer start to carry the CRLF prefix is accepted as-is.
fn find_unsol_marker(buf: &[u8]) -> Option<usize> {
    let pos = find(buf, UNSOL_MARKER)?;
    if pos > 1 && &buf[pos - 2..pos] != b"\r\n" {
        return None;
    }
    Some(pos)
}

fn strip(bytes: &[u8]) -> &[u8] {
    let is_pad = |b: &u8| matches!(*b, b' ' | b'\r' | b'\n');
    let start = bytes.iter().position(|b| !is_pad(b)).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !is_pad(b)).map_or(start, |e| e + 1);
    &bytes[start..end]
}

/// Split a stripped ack line at the first ':' into name and value.
pub fn split_name_value(line: &[u8]) -> (&[u8], Option<&[u8]>) {
    match find_byte(line, b':') {
        Some(i) => (strip(&line[..i]), Some(strip(&line[i + 1..]))),
        None => (line, None),
    }
}

/// Recognize the earliest complete event in `buf`. Returns the event and the
/// number of bytes consumed from the front, or None when nothing complete is
/// present yet.
pub fn next_event(buf: &[u8]) -> Option<(ScanEvent, usize)> {
    if buf.is_empty() {
        return None;
    }
    let marks = scan_marks(buf);

    // RING folds into the OK class at RING's offset.
    let (ok, ok_len) = match (marks.ok, marks.ring) {
        (None, Some(r)) => (Some(r), RING_TERMINATOR.len()),
        (Some(o), Some(r)) if r < o => (Some(r), RING_TERMINATOR.len()),
        (o, _) => (o, OK_TERMINATOR.len()),
    };

    // The unsolicited marker is honored only when no terminator occurs at or
    // before it. A marker without a complete payload, or a plain
    // "+CPOSR: <n>" registration-status line acknowledged by a later OK,
    // falls through to terminator processing instead.
    if let Some(unsol) = marks.unsol {
        let preceded = [ok, marks.error, marks.ctrl_z, marks.esc]
            .iter()
            .any(|m| m.is_some_and(|p| p <= unsol));
        if !preceded {
            if let Some(event) = unsol_event(buf, unsol, &marks) {
                return Some(event);
            }
        }
    }

    // OK-class: OK/RING, or a lone Ctrl-Z.
    let (ok_pos, ok_term_len) = match (ok, marks.ctrl_z) {
        (Some(o), Some(z)) if z < o => (Some(z), 1),
        (Some(o), _) => (Some(o), ok_len),
        (None, Some(z)) => (Some(z), 1),
        (None, None) => (None, 0),
    };
    // ERROR-class: ERROR, or a lone Esc.
    let (err_pos, err_term_len) = match (marks.error, marks.esc) {
        (Some(e), Some(x)) if x < e => (Some(x), 1),
        (Some(e), _) => (Some(e), ERROR_TERMINATOR.len()),
        (None, Some(x)) => (Some(x), 1),
        (None, None) => (None, 0),
    };

    let (class, pos, term_len) = match (ok_pos, err_pos) {
        (Some(o), Some(e)) if e < o => (AckClass::Error, e, err_term_len),
        (Some(o), _) => (AckClass::Ok, o, ok_term_len),
        (None, Some(e)) => (AckClass::Error, e, err_term_len),
        (None, None) => return None,
    };

    let line = strip(&buf[..pos]).to_vec();
    Some((ScanEvent::Ack { class, line }, pos + term_len))
}

/// Extract an unsolicited payload at `unsol`. None means "not usable as an
/// unsolicited notification here" — either the payload delimiter has not
/// arrived yet, or the span is a registration-status response that a later
/// terminator owns; the caller falls back to terminator processing.
fn unsol_event(buf: &[u8], unsol: usize, marks: &Marks) -> Option<(ScanEvent, usize)> {
    let rest = &buf[unsol..];
    let crlf2 = find(rest, UNSOL_END_CRLF2).map(|p| (unsol + p, UNSOL_END_CRLF2.len()));
    let prompt = find(rest, UNSOL_END_PROMPT).map(|p| (unsol + p, UNSOL_END_PROMPT.len()));
    let mut end = match (crlf2, prompt) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };
    if end.is_none() {
        // a lone Ctrl-Z or Esc after the marker also delimits the payload
        let late_ctrl = marks.ctrl_z.filter(|&z| z > unsol);
        let late_esc = marks.esc.filter(|&e| e > unsol);
        end = match (late_ctrl, late_esc) {
            (Some(z), Some(e)) => Some((z.min(e), 1)),
            (Some(z), None) => Some((z, 1)),
            (None, Some(e)) => Some((e, 1)),
            (None, None) => None,
        };
    }
    let (end_pos, end_len) = end?;

    // "+CPOSR: <n>" status line with an OK behind it and no XML in between
    // is a command response, not a notification.
    if let Some(ok) = marks.ok {
        let xml_start = find_byte(&buf[..end_pos], b'<');
        if ok > 0 && xml_start.is_none_or(|x| x > ok) {
            return None;
        }
    }

    let payload = &buf[unsol..end_pos];
    let xml = match find_byte(payload, b':') {
        Some(i) => strip(&payload[i + 1..]).to_vec(),
        None => Vec::new(),
    };
    Some((ScanEvent::Unsolicited { xml }, end_pos + end_len))
}

/// Run the scanner over the assembly buffer until a pass makes no further
/// progress, consuming recognized spans and collecting the events in order.
pub fn drain_events(buf: &mut ScanBuf) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    while let Some((event, consumed)) = next_event(buf.as_slice()) {
        buf.consume(consumed);
        events.push(event);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events_one_shot(data: &[u8]) -> Vec<ScanEvent> {
        let mut buf = ScanBuf::with_capacity(8192);
        buf.push(data);
        drain_events(&mut buf)
    }

    fn events_chunked(data: &[u8], chunk: usize) -> Vec<ScanEvent> {
        let mut buf = ScanBuf::with_capacity(8192);
        let mut events = Vec::new();
        for piece in data.chunks(chunk) {
            buf.push(piece);
            events.extend(drain_events(&mut buf));
        }
        events
    }

    #[test]
    fn earliest_match_wins() {
        let data = b"ERROR\r\njunkOK\r\n";
        let events = events_one_shot(data);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ScanEvent::Ack { class: AckClass::Error, .. }));
        assert!(matches!(events[1], ScanEvent::Ack { class: AckClass::Ok, .. }));
    }

    #[test]
    fn ring_folds_into_ok_class() {
        let events = events_one_shot(b"RING\r\nstill hereOK\r\n");
        assert_eq!(events.len(), 2);
        match &events[0] {
            ScanEvent::Ack { class, line } => {
                assert_eq!(*class, AckClass::Ok);
                assert!(line.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        match &events[1] {
            ScanEvent::Ack { class, line } => {
                assert_eq!(*class, AckClass::Ok);
                assert_eq!(line, b"still here");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ctrl_z_acks_and_esc_fails() {
        let events = events_one_shot(&[b'x', CTRL_Z, b'y', ESC]);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ScanEvent::Ack { class: AckClass::Ok, .. }));
        assert!(matches!(events[1], ScanEvent::Ack { class: AckClass::Error, .. }));
    }

    #[test]
    fn unsolicited_extraction() {
        let data = b"\r\n+CPOSR: <pos><pos_meas/></pos>\r\n\r\n";
        let events = events_one_shot(data);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ScanEvent::Unsolicited { xml } => {
                assert_eq!(xml, b"<pos><pos_meas/></pos>");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unsolicited_prompt_and_ctrl_z_delimiters() {
        let events = events_one_shot(b"\r\n+CPOSR: <a/>>\n\r\n");
        assert!(matches!(&events[0], ScanEvent::Unsolicited { xml } if xml == b"<a/>"));

        let mut with_ctrl_z = b"\r\n+CPOSR: <b/>".to_vec();
        with_ctrl_z.push(CTRL_Z);
        let events = events_one_shot(&with_ctrl_z);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ScanEvent::Unsolicited { xml } if xml == b"<b/>"));
    }

    #[test]
    fn unsolicited_gated_behind_earlier_ok() {
        // the OK earlier in the buffer must be processed first; the marker
        // is honored on the next pass
        let data = b"OK\r\n\r\n+CPOSR: <pos/>\r\n\r\n";
        let events = events_one_shot(data);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ScanEvent::Ack { class: AckClass::Ok, .. }));
        assert!(matches!(&events[1], ScanEvent::Unsolicited { xml } if xml == b"<pos/>"));
    }

    #[test]
    fn marker_requires_crlf_prefix() {
        // mid-buffer occurrence without CRLF before it is not a marker
        let data = b"garbage+CPOSR: <pos/>\r\n\r\nOK\r\n";
        let events = events_one_shot(data);
        assert!(matches!(events[0], ScanEvent::Ack { class: AckClass::Ok, .. }));
        // at buffer start the prefix cannot exist and the marker is honored
        let events = events_one_shot(b"+CPOSR: <pos/>\r\n\r\n");
        assert!(matches!(&events[0], ScanEvent::Unsolicited { .. }));
    }

    #[test]
    fn partial_unsolicited_left_in_buffer() {
        let mut buf = ScanBuf::with_capacity(8192);
        buf.push(b"\r\n+CPOSR: <pos><pos_me");
        assert!(drain_events(&mut buf).is_empty());
        assert_eq!(buf.len(), 22);
        buf.push(b"as/></pos>\r\n\r\n");
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn chunked_equals_one_shot() {
        let mut data = Vec::new();
        data.extend_from_slice(b"AT\r\rOK\r\n");
        data.extend_from_slice(b"\r\n+CPOSR: <pos><pos_meas>x</pos_meas></pos>\r\n\r\n");
        data.extend_from_slice(b"RING\r\n");
        data.extend_from_slice(b"+CPOSR: 1\r\nOK\r\n");
        data.extend_from_slice(b"ERROR\r\n");
        let reference = events_one_shot(&data);
        assert_eq!(reference.len(), 5);
        for chunk in [1, 2, 3, 5, 7, 16, 64] {
            assert_eq!(events_chunked(&data, chunk), reference, "chunk size {}", chunk);
        }
    }

    #[test]
    fn registration_status_line() {
        let events = events_one_shot(b"\r+CPOSR: 1\r\nOK\r\n");
        match &events[0] {
            ScanEvent::Ack { class: AckClass::Ok, line } => {
                let (name, value) = split_name_value(line);
                assert_eq!(name, b"+CPOSR");
                assert_eq!(value, Some(&b"1"[..]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
