//! UDP discovery responder: a single non-blocking socket answering the two
//! fixed probe strings a LAN-discovery client sends before it ever opens a
//! TCP connection. Grounded in the same `mio` registration idiom as the TCP
//! listener (`Poll::register` with an edge-triggered readable interest) —
//! the protocol itself has no precedent in the teacher, it's a bare
//! request/reply over one socket.

const DETECT_PROBE: &[u8] = b"fkDetectServer";
const DETAIL_PROBE_PREFIX: &str = "fkGetDetail,";

const PROTOCOL_VERSION: &str = "0.5.19+";
const ICON_URL: &str = "";
const DESCRIPTION: &str = "";

/// Builds the reply for one received datagram. `capacity`/`online` are the
/// live numbers at the moment the probe was answered, not cached across
/// calls.
pub fn handle_datagram(datagram: &[u8], capacity: usize, online: usize) -> Vec<u8> {
    if datagram == DETECT_PROBE {
        return b"me".to_vec();
    }

    if let Ok(text) = std::str::from_utf8(datagram) {
        if let Some(tag) = text.strip_prefix(DETAIL_PROBE_PREFIX) {
            return detail_reply(tag, capacity, online).into_bytes();
        }
    }

    datagram.to_vec()
}

fn detail_reply(tag: &str, capacity: usize, online: usize) -> String {
    format!(
        "[{},{},{},{},{},{}]",
        json_string(PROTOCOL_VERSION),
        json_string(ICON_URL),
        json_string(DESCRIPTION),
        capacity,
        online,
        json_string(tag),
    )
}

fn json_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for c in raw.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
