//! Handshake verification ([RFC 6455 Section 4.2.1](https://datatracker.ietf.org/doc/html/rfc6455#section-4.2.1)).
//!
//! An upgrade request is accepted only when all eight checks below pass. None of them says
//! *why* a request failed: the caller answers every failure the same way.
use ::http::{header, Method, Version};
use base64::prelude::*;
use sha1::{Digest, Sha1};

use crate::http::Request;

/// GUID appended to the client key before hashing.
const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`.
pub fn sec_websocket_accept(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WEBSOCKET_GUID);
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

/// The request method must be `GET`.
pub fn verify_method(request: &Request) -> bool {
    request.method() == Method::GET
}

/// The request must be HTTP/1.1 or later.
pub fn verify_http_version(request: &Request) -> bool {
    request.version() >= Version::HTTP_11
}

/// The request-target must be an origin-form path without a fragment.
pub fn verify_request_uri(request: &Request) -> bool {
    let target = request.target();
    target.starts_with('/') && !target.contains('#') && target.is_ascii()
}

pub fn verify_host(request: &Request) -> bool {
    request
        .header(header::HOST)
        .is_some_and(|host| !host.trim().is_empty())
}

pub fn verify_upgrade(request: &Request) -> bool {
    request
        .header(header::UPGRADE)
        .is_some_and(|upgrade| upgrade.trim().eq_ignore_ascii_case("websocket"))
}

/// `Connection` must list `upgrade` as one of its tokens.
pub fn verify_connection(request: &Request) -> bool {
    request
        .header_tokens(header::CONNECTION)
        .iter()
        .any(|token| token.eq_ignore_ascii_case("upgrade"))
}

/// `Sec-WebSocket-Key` must be the base64 encoding of 16 bytes.
pub fn verify_key(request: &Request) -> bool {
    request
        .header(header::SEC_WEBSOCKET_KEY)
        .and_then(|key| BASE64_STANDARD.decode(key.trim()).ok())
        .is_some_and(|key| key.len() == 16)
}

/// `Sec-WebSocket-Version` must be a version `accepts` agrees to.
pub fn verify_version(request: &Request, accepts: impl Fn(u8) -> bool) -> bool {
    requested_version(request).is_some_and(accepts)
}

/// Runs every check.
pub fn verify_all(request: &Request, accepts: impl Fn(u8) -> bool) -> bool {
    verify_method(request)
        && verify_http_version(request)
        && verify_request_uri(request)
        && verify_host(request)
        && verify_upgrade(request)
        && verify_connection(request)
        && verify_key(request)
        && verify_version(request, accepts)
}

/// The numeric `Sec-WebSocket-Version`, if present and well formed.
pub fn requested_version(request: &Request) -> Option<u8> {
    request
        .header(header::SEC_WEBSOCKET_VERSION)
        .and_then(|version| version.trim().parse().ok())
}

/// Picks the first sub-protocol offered by the client that the application supports.
///
/// Offers may be spread over several `Sec-WebSocket-Protocol` headers, each holding a
/// comma-separated list; client order wins.
pub fn negotiate_sub_protocol(request: &Request, supported: &[String]) -> Option<String> {
    request
        .header_tokens(header::SEC_WEBSOCKET_PROTOCOL)
        .into_iter()
        .find(|offered| supported.iter().any(|protocol| protocol == offered))
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RequestParser;

    const VALID: [&str; 6] = [
        "Host: server.example.com",
        "Upgrade: websocket",
        "Connection: Upgrade",
        "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==",
        "Sec-WebSocket-Version: 13",
        "Origin: http://example.com",
    ];

    fn request(request_line: &str, headers: &[&str]) -> Request {
        let mut raw = format!("{request_line}\r\n");
        for header in headers {
            raw.push_str(header);
            raw.push_str("\r\n");
        }
        raw.push_str("\r\n");

        let (request, _) = RequestParser::default()
            .parse(raw.as_bytes(), None)
            .unwrap()
            .unwrap();
        request
    }

    fn without(prefix: &str) -> Vec<&'static str> {
        VALID
            .iter()
            .copied()
            .filter(|header| !header.starts_with(prefix))
            .collect()
    }

    fn rfc6455(version: u8) -> bool {
        version == 13
    }

    #[test]
    fn test_accept_key_rfc_sample() {
        assert_eq!(
            sec_websocket_accept(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_valid_request_passes() {
        let request = request("GET /chat?x=1 HTTP/1.1", &VALID);
        assert!(verify_all(&request, rfc6455));
        assert_eq!(requested_version(&request), Some(13));
    }

    #[test]
    fn test_each_check_fails_alone() {
        let line = "GET /chat HTTP/1.1";

        let failing = [
            request("POST /chat HTTP/1.1", &VALID),
            request("GET /chat HTTP/1.0", &VALID),
            request("GET chat HTTP/1.1", &VALID),
            request("GET /chat#frag HTTP/1.1", &VALID),
            request(line, &without("Host")),
            request(line, &without("Upgrade")),
            request(line, &without("Connection")),
            request(line, &without("Sec-WebSocket-Key")),
            request(line, &without("Sec-WebSocket-Version")),
        ];

        for (i, request) in failing.iter().enumerate() {
            assert!(!verify_all(request, rfc6455), "case {i}");
        }
    }

    #[test]
    fn test_upgrade_is_case_insensitive() {
        let mut headers = without("Upgrade");
        headers.push("Upgrade: WebSocket");
        assert!(verify_upgrade(&request("GET / HTTP/1.1", &headers)));

        let mut headers = without("Upgrade");
        headers.push("Upgrade: h2c");
        assert!(!verify_upgrade(&request("GET / HTTP/1.1", &headers)));
    }

    #[test]
    fn test_connection_token_list() {
        let mut headers = without("Connection");
        headers.push("Connection: keep-alive, upgrade");
        assert!(verify_connection(&request("GET / HTTP/1.1", &headers)));

        let mut headers = without("Connection");
        headers.push("Connection: keep-alive-upgrade");
        assert!(!verify_connection(&request("GET / HTTP/1.1", &headers)));
    }

    #[test]
    fn test_key_must_decode_to_16_bytes() {
        let mut headers = without("Sec-WebSocket-Key");
        headers.push("Sec-WebSocket-Key: c2hvcnQ=");
        assert!(!verify_key(&request("GET / HTTP/1.1", &headers)));

        let mut headers = without("Sec-WebSocket-Key");
        headers.push("Sec-WebSocket-Key: not base64!");
        assert!(!verify_key(&request("GET / HTTP/1.1", &headers)));
    }

    #[test]
    fn test_version_predicate() {
        let mut headers = without("Sec-WebSocket-Version");
        headers.push("Sec-WebSocket-Version: 8");
        let request = request("GET / HTTP/1.1", &headers);

        assert!(!verify_version(&request, rfc6455));
        assert!(verify_version(&request, |version| (6..=12).contains(&version)));
    }

    #[test]
    fn test_negotiate_sub_protocol() {
        let mut headers = VALID.to_vec();
        headers.push("Sec-WebSocket-Protocol: chat.v2, chat.v1");
        headers.push("Sec-WebSocket-Protocol: superchat");
        let request = request("GET / HTTP/1.1", &headers);

        let supported = vec!["superchat".to_owned(), "chat.v1".to_owned()];
        assert_eq!(
            negotiate_sub_protocol(&request, &supported),
            Some("chat.v1".to_owned())
        );

        assert_eq!(negotiate_sub_protocol(&request, &["mqtt".to_owned()]), None);
        assert_eq!(negotiate_sub_protocol(&request, &[]), None);
    }
}
