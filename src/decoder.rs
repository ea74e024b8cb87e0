use crate::queue::Event;

/// Stateless recognizer for the ASCII memcache protocol. Works one TCP
/// payload at a time; a `VALUE` line straddling a segment boundary is
/// missed by design (cross-packet reassembly is a non-goal). Malformed or
/// partial lines are skipped without error so a single bad packet can never
/// take down the capture loop.
#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    pub memcache_port: u16,
    /// Whether `GET`/`GETS` requests should themselves emit size-0 events.
    /// The recommended default is `false`: counting only on the response
    /// side keeps `size`/`bandwidth` consistent with what was actually
    /// transferred (see spec Open Question on this toggle).
    pub count_requests: bool,
}

impl DecoderConfig {
    pub fn new(memcache_port: u16) -> Self {
        DecoderConfig { memcache_port, count_requests: false }
    }
}

/// Splits `payload` into CRLF-terminated lines. Any bytes after the final
/// `\r\n` are a partial line (cut off by the packet boundary) and are
/// dropped rather than guessed at.
fn crlf_lines(payload: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i + 1 < payload.len() {
        if payload[i] == b'\r' && payload[i + 1] == b'\n' {
            lines.push(&payload[start..i]);
            i += 2;
            start = i;
        } else {
            i += 1;
        }
    }
    lines
}

fn starts_with_ignore_case(line: &[u8], prefix: &[u8]) -> bool {
    if line.len() < prefix.len() {
        return false;
    }
    line[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Splits on runs of ASCII spaces, discarding empty fields.
fn split_fields(line: &[u8]) -> Vec<&[u8]> {
    line.split(|b| *b == b' ').filter(|f| !f.is_empty()).collect()
}

/// Parses a `GET <key>...` / `GETS <key>...` request line into the opaque
/// keys it names. Returns an empty vec for anything else.
fn decode_request_line(line: &[u8]) -> Vec<Vec<u8>> {
    let fields = split_fields(line);
    let verb = match fields.first() {
        Some(v) => *v,
        None => return Vec::new(),
    };
    if !verb.eq_ignore_ascii_case(b"get") && !verb.eq_ignore_ascii_case(b"gets")
    {
        return Vec::new();
    }
    fields[1..].iter().map(|k| k.to_vec()).collect()
}

/// Parses a single response line. `VALUE <key> <flags> <bytes>` yields the
/// key and the declared size; `END` and anything unrecognized yield
/// nothing without being treated as an error.
fn decode_value_line(line: &[u8]) -> Option<(Vec<u8>, u32)> {
    if !starts_with_ignore_case(line, b"value ") {
        return None;
    }
    let fields = split_fields(line);
    if fields.len() < 4 {
        return None;
    }
    let key = fields[1].to_vec();
    let bytes_str = std::str::from_utf8(fields[3]).ok()?;
    let size: u32 = bytes_str.parse().ok()?;
    Some((key, size))
}

/// Decodes zero or more events out of a single TCP payload, given which
/// ports the segment was exchanged between. `dst_port == memcache_port`
/// identifies the request direction, `src_port == memcache_port` the
/// response direction; traffic matching neither is ignored.
pub fn decode(
    payload: &[u8], src_port: u16, dst_port: u16, cfg: &DecoderConfig,
) -> Vec<Event> {
    let mut events = Vec::new();

    if dst_port == cfg.memcache_port {
        if cfg.count_requests {
            for line in crlf_lines(payload) {
                for key in decode_request_line(line) {
                    events.push(Event::new(key, 0));
                }
            }
        }
    } else if src_port == cfg.memcache_port {
        for line in crlf_lines(payload) {
            if let Some((key, size)) = decode_value_line(line) {
                events.push(Event::new(key, size));
            }
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORT: u16 = 11211;

    #[test]
    fn s1_single_get_value_pair() {
        let cfg = DecoderConfig::new(PORT);
        let request = b"GET foo\r\n";
        let response = b"VALUE foo 0 3\r\nbar\r\nEND\r\n";

        let req_events = decode(request, 54321, PORT, &cfg);
        assert!(req_events.is_empty(), "requests are not sized by default");

        let resp_events = decode(response, PORT, 54321, &cfg);
        assert_eq!(resp_events.len(), 1);
        assert_eq!(resp_events[0].key, b"foo");
        assert_eq!(resp_events[0].size, 3);
    }

    #[test]
    fn s2_multi_key_response() {
        let cfg = DecoderConfig::new(PORT);
        let response = b"VALUE a 0 1\r\nx\r\nVALUE b 0 2\r\nyy\r\nEND\r\n";
        let events = decode(response, PORT, 54321, &cfg);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key, b"a");
        assert_eq!(events[0].size, 1);
        assert_eq!(events[1].key, b"b");
        assert_eq!(events[1].size, 2);
    }

    #[test]
    fn s6_malformed_payload_yields_nothing() {
        let cfg = DecoderConfig::new(PORT);
        let events = decode(b"VALUE incomplete", PORT, 54321, &cfg);
        assert!(events.is_empty());
    }

    #[test]
    fn gets_is_recognized_case_insensitively() {
        let mut cfg = DecoderConfig::new(PORT);
        cfg.count_requests = true;
        let events = decode(b"gets foo bar\r\n", 54321, PORT, &cfg);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key, b"foo");
        assert_eq!(events[1].key, b"bar");
    }

    #[test]
    fn unrelated_ports_are_ignored() {
        let cfg = DecoderConfig::new(PORT);
        let events = decode(b"VALUE a 0 1\r\nx\r\nEND\r\n", 9999, 9998, &cfg);
        assert!(events.is_empty());
    }

    #[test]
    fn trailing_partial_line_is_dropped() {
        let cfg = DecoderConfig::new(PORT);
        let events = decode(b"VALUE a 0 1\r\nx\r\nVALUE b 0", PORT, 54321, &cfg);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, b"a");
    }
}
