use crate::traffic::{TrafficError, TrafficReading, TrafficSource};
use serde::Deserialize;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Traffic source polling a plain `http://` JSON endpoint.
///
/// Issues `GET <path>?checkpoint=<id>` and expects `{"delay_minutes": <f64>}`.
#[derive(Debug, Clone)]
pub struct HttpTrafficSource {
    endpoint: String,
    timeout: Duration,
}

impl HttpTrafficSource {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DelayResponse {
    delay_minutes: f64,
}

impl TrafficSource for HttpTrafficSource {
    fn fetch(&self, checkpoint_id: &str, now_ms: i64) -> Result<TrafficReading, TrafficError> {
        if checkpoint_id.is_empty()
            || !checkpoint_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(TrafficError::InvalidUrl(format!(
                "checkpoint id not url-safe: {checkpoint_id}"
            )));
        }
        let body = send_http_get(&self.endpoint, checkpoint_id, self.timeout)?;
        let response: DelayResponse = serde_json::from_str(&body)?;
        if !response.delay_minutes.is_finite() || response.delay_minutes < 0.0 {
            return Err(TrafficError::Unavailable(format!(
                "invalid delay: {}",
                response.delay_minutes
            )));
        }
        Ok(TrafficReading {
            delay_minutes: response.delay_minutes,
            fetched_at_ms: now_ms,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ParsedUrl {
    host: String,
    port: u16,
    path: String,
}

fn parse_http_url(endpoint: &str) -> Result<ParsedUrl, TrafficError> {
    let trimmed = endpoint
        .strip_prefix("http://")
        .ok_or_else(|| TrafficError::InvalidUrl("only http:// supported".to_string()))?;

    let mut parts = trimmed.splitn(2, '/');
    let host_port = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TrafficError::InvalidUrl("missing host".to_string()))?;
    let path = match parts.next() {
        Some(path) if !path.is_empty() => format!("/{path}"),
        _ => "/".to_string(),
    };

    let mut host_parts = host_port.splitn(2, ':');
    let host = host_parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TrafficError::InvalidUrl("missing host".to_string()))?;
    let port = match host_parts.next() {
        Some(port_str) if !port_str.is_empty() => port_str
            .parse::<u16>()
            .map_err(|_| TrafficError::InvalidUrl("invalid port".to_string()))?,
        _ => 80,
    };

    Ok(ParsedUrl {
        host: host.to_string(),
        port,
        path,
    })
}

fn send_http_get(
    endpoint: &str,
    checkpoint_id: &str,
    timeout: Duration,
) -> Result<String, TrafficError> {
    let parsed = parse_http_url(endpoint)?;
    let addr = (parsed.host.as_str(), parsed.port)
        .to_socket_addrs()
        .map_err(|err| TrafficError::Dns(err.to_string()))?
        .next()
        .ok_or_else(|| TrafficError::Dns("no addresses resolved".to_string()))?;

    let mut stream = TcpStream::connect_timeout(&addr, timeout).map_err(TrafficError::Connect)?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(TrafficError::Io)?;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(TrafficError::Io)?;

    let separator = if parsed.path.contains('?') { '&' } else { '?' };
    let request = format!(
        "GET {}{}checkpoint={} HTTP/1.0\r\nHost: {}\r\nAccept: application/json\r\nConnection: close\r\n\r\n",
        parsed.path, separator, checkpoint_id, parsed.host
    );

    stream
        .write_all(request.as_bytes())
        .map_err(TrafficError::Io)?;

    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .map_err(TrafficError::Io)?;

    let (headers, body) = response
        .split_once("\r\n\r\n")
        .ok_or_else(|| TrafficError::Http(0, "invalid http response".to_string()))?;

    let status_line = headers
        .lines()
        .next()
        .ok_or_else(|| TrafficError::Http(0, "missing status line".to_string()))?;
    let status_code = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| TrafficError::Http(0, "missing status code".to_string()))?
        .parse::<u16>()
        .map_err(|_| TrafficError::Http(0, "invalid status code".to_string()))?;

    let body = decode_body(headers, body)?;
    if status_code >= 400 {
        return Err(TrafficError::Http(status_code, body.trim().to_string()));
    }

    Ok(body)
}

fn header_value<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    headers.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn decode_body(headers: &str, body: &str) -> Result<String, TrafficError> {
    if header_value(headers, "transfer-encoding")
        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"))
    {
        return decode_chunked(body);
    }
    if let Some(length) = header_value(headers, "content-length") {
        let length = length
            .parse::<usize>()
            .map_err(|_| TrafficError::Http(0, "invalid content-length".to_string()))?;
        return body
            .get(..length)
            .map(str::to_string)
            .ok_or_else(|| TrafficError::Http(0, "truncated body".to_string()));
    }
    Ok(body.to_string())
}

fn decode_chunked(mut rest: &str) -> Result<String, TrafficError> {
    let malformed = || TrafficError::Http(0, "malformed chunked body".to_string());
    let mut decoded = String::new();
    loop {
        let (size_line, after) = rest.split_once("\r\n").ok_or_else(malformed)?;
        let size_hex = size_line.split(';').next().map(str::trim).unwrap_or_default();
        let size = usize::from_str_radix(size_hex, 16).map_err(|_| malformed())?;
        if size == 0 {
            return Ok(decoded);
        }
        decoded.push_str(after.get(..size).ok_or_else(malformed)?);
        rest = after
            .get(size..)
            .and_then(|tail| tail.strip_prefix("\r\n"))
            .ok_or_else(malformed)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn serve_once(response: &'static str) -> Result<(String, thread::JoinHandle<String>), std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let handle = thread::spawn(move || {
            let mut request = String::new();
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                if let Ok(n) = stream.read(&mut buf) {
                    request = String::from_utf8_lossy(&buf[..n]).to_string();
                }
                let _ = stream.write_all(response.as_bytes());
            }
            request
        });
        Ok((format!("http://{addr}/traffic"), handle))
    }

    #[test]
    fn parse_url_defaults_port_and_path() -> Result<(), TrafficError> {
        let parsed = parse_http_url("http://traffic.local")?;
        assert_eq!(
            parsed,
            ParsedUrl {
                host: "traffic.local".to_string(),
                port: 80,
                path: "/".to_string()
            }
        );
        Ok(())
    }

    #[test]
    fn parse_url_reads_port_and_path() -> Result<(), TrafficError> {
        let parsed = parse_http_url("http://10.0.0.2:9000/v1/delay")?;
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.path, "/v1/delay");
        Ok(())
    }

    #[test]
    fn parse_url_rejects_https_and_bad_port() {
        assert!(matches!(
            parse_http_url("https://traffic.local"),
            Err(TrafficError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_http_url("http://traffic.local:notaport/"),
            Err(TrafficError::InvalidUrl(_))
        ));
    }

    #[test]
    fn fetch_reads_delay_from_json_body() -> Result<(), Box<dyn std::error::Error>> {
        let (endpoint, handle) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"delay_minutes\": 12.5}",
        )?;
        let source = HttpTrafficSource::new(endpoint, DEFAULT_TIMEOUT);

        let reading = source.fetch("north-gate", 42)?;
        let request = handle.join().map_err(|_| "server thread panicked")?;

        assert_eq!(reading.delay_minutes, 12.5);
        assert_eq!(reading.fetched_at_ms, 42);
        assert!(request.starts_with("GET /traffic?checkpoint=north-gate HTTP/1.0"));
        Ok(())
    }

    #[test]
    fn fetch_maps_error_status() -> Result<(), Box<dyn std::error::Error>> {
        let (endpoint, handle) = serve_once("HTTP/1.1 503 Service Unavailable\r\n\r\nbusy")?;
        let source = HttpTrafficSource::new(endpoint, DEFAULT_TIMEOUT);

        let result = source.fetch("north-gate", 0);
        let _ = handle.join();

        assert!(matches!(result, Err(TrafficError::Http(503, body)) if body == "busy"));
        Ok(())
    }

    #[test]
    fn fetch_rejects_unsafe_checkpoint_id() {
        let source = HttpTrafficSource::new("http://127.0.0.1:1/", DEFAULT_TIMEOUT);
        assert!(matches!(
            source.fetch("a b", 0),
            Err(TrafficError::InvalidUrl(_))
        ));
    }

    #[test]
    fn fetch_decodes_chunked_body() -> Result<(), Box<dyn std::error::Error>> {
        let (endpoint, handle) = serve_once(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n10\r\n{\"delay_minutes\"\r\n7\r\n: 7.25}\r\n0\r\n\r\n",
        )?;
        let source = HttpTrafficSource::new(endpoint, DEFAULT_TIMEOUT);

        let reading = source.fetch("north-gate", 7)?;
        let _ = handle.join();

        assert_eq!(reading.delay_minutes, 7.25);
        Ok(())
    }

    #[test]
    fn content_length_bounds_the_body() -> Result<(), TrafficError> {
        let body = decode_body(
            "HTTP/1.1 200 OK\r\nContent-Length: 4",
            "busyTRAILING",
        )?;
        assert_eq!(body, "busy");
        Ok(())
    }

    #[test]
    fn truncated_chunk_is_rejected() {
        assert!(matches!(
            decode_chunked("a\r\nshort"),
            Err(TrafficError::Http(0, _))
        ));
    }
}
