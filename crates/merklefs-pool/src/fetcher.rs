//! Client side of the fetcher RPC.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How long one fetch exchange may block a filesystem worker.
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Wire request: the blob to materialise in the pool.
#[derive(Debug, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Content hash, also the blob's file name under the pool.
    pub key: String,
}

/// Wire reply: whether the blob is now present in the pool.
#[derive(Debug, Serialize, Deserialize)]
pub struct FetchReply {
    /// True when the blob named by the request key exists in the pool.
    pub ok: bool,
}

/// Blocking client for the fetcher service.
///
/// One connection per call; each exchange is a single newline-delimited
/// JSON object in each direction. Any transport failure is reported as
/// "blob unavailable" rather than an error.
pub struct Fetcher {
    endpoint: String,
}

impl Fetcher {
    /// Creates a client for the given endpoint, either `unix:<path>` or a
    /// TCP `<host>:<port>` address.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// Asks the service to materialise `key` in the pool.
    pub fn fetch(&self, key: &str) -> bool {
        match self.call(key) {
            Ok(ok) => {
                debug!(key = key, ok = ok, "fetch completed");
                ok
            }
            Err(err) => {
                warn!(key = key, endpoint = %self.endpoint, error = %err, "fetch failed");
                false
            }
        }
    }

    fn call(&self, key: &str) -> io::Result<bool> {
        if let Some(path) = self.endpoint.strip_prefix("unix:") {
            let stream = UnixStream::connect(path)?;
            stream.set_read_timeout(Some(FETCH_TIMEOUT))?;
            stream.set_write_timeout(Some(FETCH_TIMEOUT))?;
            exchange(stream, key)
        } else {
            let stream = TcpStream::connect(&self.endpoint)?;
            stream.set_read_timeout(Some(FETCH_TIMEOUT))?;
            stream.set_write_timeout(Some(FETCH_TIMEOUT))?;
            exchange(stream, key)
        }
    }
}

fn exchange<S: Read + Write>(mut stream: S, key: &str) -> io::Result<bool> {
    let mut request = serde_json::to_vec(&FetchRequest {
        key: key.to_owned(),
    })?;
    request.push(b'\n');
    stream.write_all(&request)?;
    stream.flush()?;

    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    let reply: FetchReply = serde_json::from_str(&line)?;
    Ok(reply.ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    fn stub_service(reply: &'static str) -> (tempfile::TempDir, String) {
        let dir = tempfile::TempDir::new().unwrap();
        let sock = dir.path().join("fetcher.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = String::new();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                reader.read_line(&mut request).unwrap();
                let request: FetchRequest = serde_json::from_str(&request).unwrap();
                assert!(!request.key.is_empty());
                stream.write_all(reply.as_bytes()).unwrap();
            }
        });
        let endpoint = format!("unix:{}", sock.display());
        (dir, endpoint)
    }

    #[test]
    fn test_fetch_ok() {
        let (_dir, endpoint) = stub_service("{\"ok\": true}\n");
        assert!(Fetcher::new(endpoint).fetch("cafebabe"));
    }

    #[test]
    fn test_fetch_denied() {
        let (_dir, endpoint) = stub_service("{\"ok\": false}\n");
        assert!(!Fetcher::new(endpoint).fetch("cafebabe"));
    }

    #[test]
    fn test_transport_failure_is_false() {
        let fetcher = Fetcher::new("unix:/nonexistent/fetcher.sock");
        assert!(!fetcher.fetch("cafebabe"));
    }

    #[test]
    fn test_garbled_reply_is_false() {
        let (_dir, endpoint) = stub_service("not json\n");
        assert!(!Fetcher::new(endpoint).fetch("cafebabe"));
    }
}
