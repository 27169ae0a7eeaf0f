//! Host-header classification of a single request segment.
//!
//! `httparse` does the parsing; its result is replayed as header events into a
//! [`ClassificationSession`] that lives only for one call.

use log::{debug, info, log_enabled, trace, Level};

const MAX_HEADERS: usize = 64;
/// Longest Host value kept for comparison; longer values are truncated.
pub const MAX_HOST_LEN: usize = 1023;

/// Receiver of streaming request-parser events.
pub trait RequestEvents {
    fn on_header_field(&mut self, name: &[u8]);
    fn on_header_value(&mut self, value: &[u8]);
    fn on_headers_complete(&mut self);
}

/// Parses `data` as an HTTP request head and reports what it sees to `events`.
///
/// Returns the number of bytes consumed, which is only the full head length
/// when the header block was complete. Parser errors consume nothing.
/// The header count is bounded only by what fits in `data`.
pub fn feed<E: RequestEvents>(data: &[u8], events: &mut E) -> usize {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    match parse_into(data, &mut headers, events) {
        Err(httparse::Error::TooManyHeaders) => {
            // Shortest header line is "a:\n".
            let mut headers = vec![httparse::EMPTY_HEADER; data.len() / 3 + 1];
            trace!("More than {} headers, retrying with {}", MAX_HEADERS, headers.len());
            parse_into(data, &mut headers, events).unwrap_or_else(|e| {
                trace!("Not an HTTP request: {}", e);
                0
            })
        }
        Err(e) => {
            trace!("Not an HTTP request: {}", e);
            0
        }
        Ok(consumed) => consumed,
    }
}

fn parse_into<'b, E: RequestEvents>(
    data: &'b [u8],
    headers: &mut [httparse::Header<'b>],
    events: &mut E,
) -> Result<usize, httparse::Error> {
    let mut req = httparse::Request::new(headers);
    let status = req.parse(data)?;

    for header in req.headers.iter().take_while(|h| !h.name.is_empty()) {
        events.on_header_field(header.name.as_bytes());
        events.on_header_value(header.value);
    }

    Ok(match status {
        httparse::Status::Complete(consumed) => {
            events.on_headers_complete();
            consumed
        }
        httparse::Status::Partial => 0,
    })
}

/// Per-call parser state. Created fresh for every classification.
#[derive(Debug, Default)]
pub struct ClassificationSession {
    headers_complete: bool,
    is_host: bool,
    host: Option<Vec<u8>>,
}

impl ClassificationSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last Host value seen, if any.
    pub fn host(&self) -> Option<&[u8]> {
        self.host.as_deref()
    }

    pub fn headers_complete(&self) -> bool {
        self.headers_complete
    }

    pub fn host_matches(&self, target: &str) -> bool {
        self.headers_complete
            && self
                .host()
                .is_some_and(|host| host.eq_ignore_ascii_case(target.as_bytes()))
    }
}

impl RequestEvents for ClassificationSession {
    fn on_header_field(&mut self, name: &[u8]) {
        self.is_host = name.eq_ignore_ascii_case(b"host");
    }

    fn on_header_value(&mut self, value: &[u8]) {
        if !self.is_host {
            return;
        }
        let value = value.trim_ascii();
        let len = value.len().min(MAX_HOST_LEN);
        self.host = Some(value[..len].to_vec());
        self.is_host = false;
    }

    fn on_headers_complete(&mut self) {
        self.headers_complete = true;
    }
}

/// True when `payload` carries a complete HTTP request head whose Host
/// header equals `target_host`, ignoring ASCII case.
pub fn matches(payload: &[u8], target_host: &str) -> bool {
    let mut session = ClassificationSession::new();
    let consumed = feed(payload, &mut session);

    if !session.headers_complete() {
        debug!(
            "Incomplete request head ({} of {} bytes parsed)",
            consumed,
            payload.len()
        );
        return false;
    }

    let Some(host) = session.host() else {
        debug!("Request has no Host header");
        return false;
    };
    if !session.host_matches(target_host) {
        debug!("Host {:?} does not match", String::from_utf8_lossy(host));
        return false;
    }

    if log_enabled!(Level::Trace) {
        trace!("{}", String::from_utf8_lossy(payload));
    }
    info!("Successful match on host {}", String::from_utf8_lossy(host));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_matches_case_insensitive() {
        let payload = b"GET / HTTP/1.1\r\nHost: BLOCKED.example\r\n\r\n";
        assert!(matches(payload, "blocked.example"));
    }

    #[test]
    fn test_other_host_does_not_match() {
        let payload = b"GET / HTTP/1.1\r\nHost: other.example\r\n\r\n";
        assert!(!matches(payload, "blocked.example"));
    }

    #[test]
    fn test_header_name_any_case() {
        let payload = b"POST /form HTTP/1.1\r\nhOsT: blocked.example\r\nContent-Length: 0\r\n\r\n";
        assert!(matches(payload, "blocked.example"));
    }

    #[test]
    fn test_missing_host() {
        let payload = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n";
        assert!(!matches(payload, "blocked.example"));
        assert!(!matches(payload, ""));
    }

    #[test]
    fn test_missing_host_session_has_no_host() {
        let mut session = ClassificationSession::new();
        feed(b"GET / HTTP/1.0\r\n\r\n", &mut session);
        assert!(session.headers_complete());
        assert_eq!(session.host(), None);
        assert!(!session.host_matches(""));
    }

    #[test]
    fn test_empty_host_value_is_present() {
        let payload = b"GET / HTTP/1.1\r\nHost:\r\n\r\n";
        assert!(matches(payload, ""));
        assert!(!matches(payload, "blocked.example"));
    }

    #[test]
    fn test_many_headers_still_match() {
        let filler: String = (0..70).map(|i| format!("X-H{}: v\r\n", i)).collect();

        let host_first = format!("GET / HTTP/1.1\r\nHost: blocked.example\r\n{}\r\n", filler);
        assert!(matches(host_first.as_bytes(), "blocked.example"));

        let host_last = format!("GET / HTTP/1.1\r\n{}Host: blocked.example\r\n\r\n", filler);
        assert!(matches(host_last.as_bytes(), "blocked.example"));
        assert!(!matches(host_last.as_bytes(), "other.example"));
    }

    #[test]
    fn test_many_headers_truncated_head() {
        let filler: String = (0..100).map(|_| "a: b\n").collect();
        let payload = format!("GET / HTTP/1.1\nHost: blocked.example\n{}", filler);
        assert!(!matches(payload.as_bytes(), "blocked.example"));
        assert!(matches(format!("{}\n", payload).as_bytes(), "blocked.example"));
    }

    #[test]
    fn test_truncated_head() {
        let payload = b"GET / HTTP/1.1\r\nHost: blocked.example\r\nAccept: */*\r\n";
        assert!(!matches(payload, "blocked.example"));

        let mut session = ClassificationSession::new();
        assert_eq!(feed(payload, &mut session), 0);
        assert!(!session.headers_complete());
    }

    #[test]
    fn test_not_http() {
        assert!(!matches(b"\x16\x03\x01\x02\x00\x01\x00\x01\xfc\x03\x03", "blocked.example"));
        assert!(!matches(b"", "blocked.example"));
        assert!(!matches(b"hello world\r\n\r\n", "blocked.example"));
    }

    #[test]
    fn test_prefix_header_name_is_not_host() {
        let payload = b"GET / HTTP/1.1\r\nHostname: blocked.example\r\nHost: fine.example\r\n\r\n";
        assert!(!matches(payload, "blocked.example"));
        assert!(matches(payload, "fine.example"));
    }

    #[test]
    fn test_value_with_port_is_compared_verbatim() {
        let payload = b"GET / HTTP/1.1\r\nHost: blocked.example:8080\r\n\r\n";
        assert!(!matches(payload, "blocked.example"));
        assert!(matches(payload, "blocked.example:8080"));
    }

    #[test]
    fn test_long_host_is_truncated() {
        let long = "a".repeat(2000);
        let payload = format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", long);

        let mut session = ClassificationSession::new();
        feed(payload.as_bytes(), &mut session);
        assert_eq!(session.host().map(<[u8]>::len), Some(MAX_HOST_LEN));
        assert!(!matches(payload.as_bytes(), &long));
        assert!(matches(payload.as_bytes(), &long[..MAX_HOST_LEN]));
    }

    #[test]
    fn test_sessions_do_not_share_state() {
        let hit = b"GET / HTTP/1.1\r\nHost: blocked.example\r\n\r\n";
        let miss = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n";

        assert!(matches(hit, "blocked.example"));
        assert!(!matches(miss, "blocked.example"));
        assert!(matches(hit, "blocked.example"));
    }

    #[test]
    fn test_complete_head_consumes_head_only() {
        let payload = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\nbody";
        let mut session = ClassificationSession::new();
        assert_eq!(feed(payload, &mut session), payload.len() - 4);
        assert!(session.headers_complete());
        assert_eq!(session.host(), Some(&b"a"[..]));
    }

    proptest! {
        #[test]
        fn prop_host_matches_in_any_case(
            host in "[a-z0-9]{1,20}(\\.[a-z0-9]{1,10}){0,3}",
            upper_mask in proptest::collection::vec(any::<bool>(), 64),
            name_mask in proptest::collection::vec(any::<bool>(), 4),
        ) {
            let sent: String = host
                .chars()
                .zip(upper_mask.iter().cycle())
                .map(|(c, up)| if *up { c.to_ascii_uppercase() } else { c })
                .collect();
            let name: String = "host"
                .chars()
                .zip(name_mask.iter())
                .map(|(c, up)| if *up { c.to_ascii_uppercase() } else { c })
                .collect();
            let payload = format!("GET /x HTTP/1.1\r\nAccept: */*\r\n{}: {}\r\n\r\n", name, sent);

            prop_assert!(matches(payload.as_bytes(), &host));
        }

        #[test]
        fn prop_different_host_never_matches(
            host in "[a-z]{1,16}\\.example",
            target in "[a-z]{1,16}\\.test",
        ) {
            let payload = format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", host);
            prop_assert!(!matches(payload.as_bytes(), &target));
        }

        #[test]
        fn prop_truncation_never_matches(cut in 0usize..40) {
            let payload = b"GET / HTTP/1.1\r\nHost: blocked.example\r\n\r\n";
            // The full head is 41 bytes; any shorter prefix lacks the final CRLF.
            prop_assert!(!matches(&payload[..cut], "blocked.example"));
        }

        #[test]
        fn prop_arbitrary_bytes_do_not_panic(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = matches(&data, "blocked.example");
        }
    }
}
