//! Networking scenarios against a loopback HTTP host.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::thread;

use tempfile::TempDir;

use weft::Runtime;

fn write_script(
    dir: &Path,
    name: &str,
    source: &str,
) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, source).expect("write script");
    path
}

/// Serve each canned body once, in accept order.
fn serve_bodies(bodies: Vec<&'static str>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = listener.local_addr().expect("addr");
    thread::spawn(move || {
        for body in bodies {
            let (mut stream, _) = match listener.accept() {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let mut scratch = [0u8; 1024];
            let _ = stream.read(&mut scratch);
            let response = format!(
                "HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });
    format!("http://{}", address)
}

#[test]
fn get_async_yields_and_resumes_with_the_body() {
    let base = serve_bodies(vec!["hello"]);
    let dir = TempDir::new().expect("tempdir");
    let main = write_script(
        dir.path(),
        "net.weft",
        &format!(
            r#"
local body = net.getAsync("{}/ok")
assert(body == "hello")
"#,
            base
        ),
    );
    assert!(Runtime::new().run_file(&main, &[]));
}

#[test]
fn get_blocks_and_returns_the_body() {
    let base = serve_bodies(vec!["sync body"]);
    let dir = TempDir::new().expect("tempdir");
    let main = write_script(
        dir.path(),
        "net.weft",
        &format!("assert(net.get(\"{}/s\") == \"sync body\")", base),
    );
    assert!(Runtime::new().run_file(&main, &[]));
}

#[test]
fn sequential_async_requests_complete_in_order() {
    let base = serve_bodies(vec!["first", "second"]);
    let dir = TempDir::new().expect("tempdir");
    let main = write_script(
        dir.path(),
        "net.weft",
        &format!(
            r#"
local a = net.getAsync("{base}/a")
local b = net.getAsync("{base}/b")
assert(a == "first")
assert(b == "second")
"#,
            base = base
        ),
    );
    assert!(Runtime::new().run_file(&main, &[]));
}

#[test]
fn failed_requests_raise_in_the_script() {
    let dir = TempDir::new().expect("tempdir");
    // nothing listens on this port; the script observes a raised error
    let main = write_script(
        dir.path(),
        "net.weft",
        "net.getAsync(\"http://127.0.0.1:1/unreachable\")",
    );
    assert!(!Runtime::new().run_file(&main, &[]));
}

#[test]
fn unsupported_schemes_raise_in_the_script() {
    let dir = TempDir::new().expect("tempdir");
    let main = write_script(
        dir.path(),
        "net.weft",
        "net.get(\"ftp://example.invalid/file\")",
    );
    assert!(!Runtime::new().run_file(&main, &[]));
}
