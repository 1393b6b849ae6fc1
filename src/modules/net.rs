//! The `net` host module.
//!
//! `net.get` blocks the calling thread; `net.getAsync` follows the async
//! work bridge: validate on the calling thread, capture a resume token,
//! dispatch the request to the worker pool, yield, and let the completion
//! resume the thread with the body or a raised error.
//!
//! The client speaks plain HTTP/1.0 over `std::net::TcpStream`, following
//! redirects. `https` targets are rejected.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use tracing::debug;

use crate::runtime::{worker, ResumeToken};
use crate::vm::{NativeFn, Value};

use super::{check_string, runtime_of, HostModule};

const MAX_REDIRECTS: usize = 5;

pub struct NetModule;

impl HostModule for NetModule {
    fn name(&self) -> &'static str {
        "net"
    }

    fn exports(&self) -> Vec<NativeFn> {
        vec![
            NativeFn::sync("get", |cx, args| {
                let url = check_string("get", &args, 0)?;
                let timeout = connect_timeout(cx)?;
                match request(&url, timeout) {
                    Ok(body) => Ok(vec![Value::from(body)]),
                    Err(err) => Err(crate::vm::VmError::script(format!(
                        "network request failed: {}",
                        err
                    ))),
                }
            }),
            NativeFn::new("getAsync", |cx, args| {
                Box::pin(async move {
                    let url = check_string("getAsync", &args, 0)?;
                    let timeout = connect_timeout(&cx)?;
                    let token = ResumeToken::acquire(&cx)?;
                    worker::submit(move || match request(&url, timeout) {
                        Ok(body) => token.complete(move |_rt| vec![Value::from(body)]),
                        Err(err) => {
                            token.fail(format!("network request failed: {}", err))
                        }
                    });
                    cx.suspend().await
                })
            }),
        ]
    }
}

fn connect_timeout(cx: &crate::vm::CallCx) -> Result<Duration, crate::vm::VmError> {
    let rt = runtime_of(cx)?;
    Ok(Duration::from_millis(rt.config().http_connect_timeout_ms))
}

struct Response {
    status: u16,
    location: Option<String>,
    body: String,
}

/// Perform a GET, following redirects. Transport failures are errors; HTTP
/// error statuses still return their body, the way the synchronous client
/// libraries the scripts are used to behave.
pub fn request(
    url: &str,
    timeout: Duration,
) -> Result<String, String> {
    debug!("requesting {}", url);
    let mut target = url.to_string();
    for _ in 0..=MAX_REDIRECTS {
        let response = fetch_once(&target, timeout)?;
        if matches!(response.status, 301 | 302 | 303 | 307 | 308) {
            if let Some(location) = response.location {
                target = location;
                continue;
            }
        }
        return Ok(response.body);
    }
    Err("too many redirects".to_string())
}

fn fetch_once(
    url: &str,
    timeout: Duration,
) -> Result<Response, String> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| format!("unsupported url '{}' (only http:// is supported)", url))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(format!("unsupported url '{}' (missing host)", url));
    }
    let host = authority.split(':').next().unwrap_or(authority);
    let address = if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{}:80", authority)
    };

    let mut stream = connect(&address, timeout)?;
    stream
        .write_all(
            format!(
                "GET {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n",
                path, host
            )
            .as_bytes(),
        )
        .map_err(|e| e.to_string())?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).map_err(|e| e.to_string())?;
    parse_response(&raw)
}

fn connect(
    address: &str,
    timeout: Duration,
) -> Result<TcpStream, String> {
    use std::net::ToSocketAddrs;
    let mut addrs = address
        .to_socket_addrs()
        .map_err(|e| format!("failed to resolve {}: {}", address, e))?;
    let addr = addrs
        .next()
        .ok_or_else(|| format!("failed to resolve {}", address))?;
    TcpStream::connect_timeout(&addr, timeout).map_err(|e| e.to_string())
}

fn parse_response(raw: &[u8]) -> Result<Response, String> {
    let text = String::from_utf8_lossy(raw);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return Err("malformed response: missing header terminator".to_string());
    };
    let (head, body) = text.split_at(header_end);
    let body = &body[4..];

    let mut lines = head.lines();
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| format!("malformed status line '{}'", status_line))?;

    let mut location = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("location") {
                location = Some(value.trim().to_string());
            }
        }
    }
    Ok(Response {
        status,
        location,
        body: body.to_string(),
    })
}
