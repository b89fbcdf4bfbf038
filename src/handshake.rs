//! HTTP/1.1 upgrade handshake processing (§4.2).

use crate::error::Error;
use base64::prelude::*;
use sha1::{Digest, Sha1};
use std::collections::HashMap;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Parses the raw HTTP request text into a case-sensitive header map.
///
/// Splits on CRLF, skips the request line and the trailing blank line, and
/// for each remaining non-empty line splits on the first `:` taking the
/// value starting two characters past it (tolerating the conventional
/// `": "` separator), per §4.2/§9 Open Question 5.
pub fn parse_request_headers(request: &str) -> HashMap<String, String> {
    let mut lines: Vec<&str> = request.split("\r\n").collect();
    if lines.len() < 2 {
        return HashMap::new();
    }
    lines.remove(0);
    lines.pop();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some(colon) = line.find(':') {
            if line.len() >= colon + 2 {
                let name = line[..colon].to_string();
                let value = line[colon + 2..].to_string();
                headers.insert(name, value);
            }
        }
    }
    headers
}

/// `Sec-WebSocket-Accept = base64(SHA1(key + GUID))`.
pub fn compute_accept(sec_websocket_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sec_websocket_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// The canonical 101 Switching Protocols response, CRLF-delimited with a
/// blank-line terminator (§4.2/§6).
pub fn build_switching_protocols_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )
}

/// Validates that `request` is a `GET` and extracts its `Sec-WebSocket-Key`,
/// returning the parsed headers and the computed accept value.
pub fn process_handshake_request(
    request: &str,
) -> Result<(HashMap<String, String>, String), Error> {
    if !request.starts_with("GET") {
        return Err(Error::NotAGetRequest);
    }

    let headers = parse_request_headers(request);
    let key = headers
        .get("Sec-WebSocket-Key")
        .ok_or(Error::NoSecWebSocketKey)?;
    let accept = compute_accept(key);
    Ok((headers, accept))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_accept_matches_rfc_example() {
        assert_eq!(
            compute_accept("x3JJHMbDL1EzLkh9GBhXDw=="),
            "HSmrc0sMlYUkAGmm5OPpG2HaGWk="
        );
    }

    #[test]
    fn response_contains_computed_accept() {
        let response = build_switching_protocols_response("HSmrc0sMlYUkAGmm5OPpG2HaGWk=");
        assert_eq!(
            response,
            "HTTP/1.1 101 Switching Protocols\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Accept: HSmrc0sMlYUkAGmm5OPpG2HaGWk=\r\n\
             \r\n"
        );
    }

    #[test]
    fn header_parsing_counts_headers_between_request_line_and_blank_line() {
        let request = "GET /chat HTTP/1.1\r\n\
                        Host: example.com\r\n\
                        Upgrade: websocket\r\n\
                        Connection: Upgrade\r\n\
                        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                        Sec-WebSocket-Version: 13\r\n\
                        \r\n";
        let headers = parse_request_headers(request);
        assert_eq!(headers.len(), 5);
        assert_eq!(headers.get("Host").unwrap(), "example.com");
        assert_eq!(
            headers.get("Sec-WebSocket-Key").unwrap(),
            "dGhlIHNhbXBsZSBub25jZQ=="
        );
    }

    #[test]
    fn incomplete_request_yields_empty_map() {
        assert!(parse_request_headers("GET / HTTP/1.1").is_empty());
    }

    #[test]
    fn process_handshake_rejects_non_get() {
        let result = process_handshake_request("POST / HTTP/1.1\r\n\r\n");
        assert!(matches!(result, Err(Error::NotAGetRequest)));
    }

    #[test]
    fn process_handshake_requires_key() {
        let result = process_handshake_request("GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(matches!(result, Err(Error::NoSecWebSocketKey)));
    }
}
