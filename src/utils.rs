// src/utils.rs
use actix_web::HttpRequest;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::warn;
use std::fmt;
use std::io::Write as _;
use std::net::{IpAddr, SocketAddr};

/// Transport-level request rejections, raised before a handler gets to its
/// actual work. Converted into API error responses by the handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    MissingPeerIp,
    MissingForwardedIp,
    InvalidForwardedIp,
    Ipv6NotSupported,
    HostNotAllowed,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPeerIp => write!(f, "failed to extract client IP"),
            Self::MissingForwardedIp => {
                write!(f, "trusted proxy request is missing a forwarded IP header")
            }
            Self::InvalidForwardedIp => write!(f, "invalid forwarded IP header"),
            Self::Ipv6NotSupported => write!(f, "IPv6 game servers are not enabled"),
            Self::HostNotAllowed => write!(f, "unrecognized host"),
        }
    }
}

/// Rejects requests whose Host header (port stripped) is not in the
/// allow-list. An empty list allows everything.
pub fn ensure_host_allowed(req: &HttpRequest, hosts: &[String]) -> Result<(), RequestError> {
    if hosts.is_empty() {
        return Ok(());
    }
    let host = req.connection_info().host().to_string();
    let host = strip_port(&host).to_ascii_lowercase();
    if hosts.iter().any(|h| h.eq_ignore_ascii_case(&host)) {
        Ok(())
    } else {
        Err(RequestError::HostNotAllowed)
    }
}

fn strip_port(host: &str) -> &str {
    // Walk back over trailing digits; cut only when they follow a colon.
    // IPv6 literals in Host headers are bracketed, so their colons never
    // precede the trailing digits directly.
    let bytes = host.as_bytes();
    let mut i = bytes.len();
    while i > 0 && bytes[i - 1].is_ascii_digit() {
        i -= 1;
    }
    if i > 0 && i < bytes.len() && bytes[i - 1] == b':' {
        &host[..i - 1]
    } else {
        host
    }
}

/// Address the connect challenge probe is sent to.
pub fn challenge_addr(ip: IpAddr, port: u16, allow_ipv6: bool) -> Result<SocketAddr, RequestError> {
    if ip.is_ipv6() && !allow_ipv6 {
        return Err(RequestError::Ipv6NotSupported);
    }
    Ok(SocketAddr::new(ip, port))
}

/// Whether the caller advertised gzip in Accept-Encoding.
pub fn accepts_gzip(req: &HttpRequest) -> bool {
    let Some(header) = req.headers().get("Accept-Encoding") else {
        return false;
    };
    let Ok(value) = header.to_str() else {
        return false;
    };
    value
        .split(',')
        .any(|e| e.split(';').next().unwrap_or("").trim() == "gzip")
}

/// Compresses `buf` when the caller accepts gzip and it actually saves at
/// least 20% of the payload; otherwise returns the input untouched.
pub fn maybe_gzip(req: &HttpRequest, buf: Vec<u8>) -> (Vec<u8>, bool) {
    if !accepts_gzip(req) {
        return (buf, false);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(&buf).is_err() {
        return (buf, false);
    }
    match encoder.finish() {
        Ok(compressed) if (compressed.len() as f64) < buf.len() as f64 * 0.8 => (compressed, true),
        _ => (buf, false),
    }
}

/// Sends a systemd readiness datagram when NOTIFY_SOCKET is set. Failures
/// are logged and ignored.
pub fn sd_notify(state: &str) {
    let Ok(socket) = std::env::var("NOTIFY_SOCKET") else {
        return;
    };
    use std::os::unix::net::UnixDatagram;
    match UnixDatagram::unbound() {
        Ok(sock) => {
            if let Err(e) = sock.send_to(state.as_bytes(), &socket) {
                warn!("sd_notify {} failed: {}", state, e);
            }
        }
        Err(e) => warn!("sd_notify socket error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use flate2::read::GzDecoder;
    use std::io::Read as _;
    use std::net::Ipv6Addr;

    #[test]
    fn strip_port_handles_hosts_and_literals() {
        assert_eq!(strip_port("master.example.com:8080"), "master.example.com");
        assert_eq!(strip_port("master.example.com"), "master.example.com");
        assert_eq!(strip_port("203.0.113.7:80"), "203.0.113.7");
        assert_eq!(strip_port("[::1]:443"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }

    #[test]
    fn host_allow_list() {
        let hosts = vec!["master.example.com".to_string()];
        let req = TestRequest::default()
            .insert_header(("Host", "master.example.com:443"))
            .to_http_request();
        assert!(ensure_host_allowed(&req, &hosts).is_ok());

        let req = TestRequest::default()
            .insert_header(("Host", "evil.example.com"))
            .to_http_request();
        assert_eq!(
            ensure_host_allowed(&req, &hosts),
            Err(RequestError::HostNotAllowed)
        );

        assert!(ensure_host_allowed(&req, &[]).is_ok());
    }

    #[test]
    fn challenge_addr_gates_ipv6() {
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(
            challenge_addr(v6, 37015, false),
            Err(RequestError::Ipv6NotSupported)
        );
        assert!(challenge_addr(v6, 37015, true).is_ok());
    }

    #[test]
    fn gzip_only_when_advertised_and_worth_it() {
        let big = vec![b'a'; 4096];
        let plain = TestRequest::default().to_http_request();
        let (body, compressed) = maybe_gzip(&plain, big.clone());
        assert!(!compressed);
        assert_eq!(body.len(), 4096);

        let gz = TestRequest::default()
            .insert_header(("Accept-Encoding", "gzip, deflate"))
            .to_http_request();
        let (body, compressed) = maybe_gzip(&gz, big.clone());
        assert!(compressed);
        let mut decoder = GzDecoder::new(&body[..]);
        let mut back = Vec::new();
        decoder.read_to_end(&mut back).unwrap();
        assert_eq!(back, big);

        // Tiny incompressible payloads stay as-is.
        let (body, compressed) = maybe_gzip(&gz, vec![7u8, 99, 3]);
        assert!(!compressed);
        assert_eq!(body, vec![7u8, 99, 3]);
    }
}
