//! Minimal HTTP endpoint for exercising [`crate::sinks::HttpSink`]
//!
//! Accepts one request per connection, records it and answers with the next
//! scripted status (200 once the script runs out).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One request as the stub server saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// HTTP method
    pub method: String,
    /// Request target, e.g. `/upload`
    pub path: String,
    /// Raw header block
    pub headers: String,
    /// Raw body bytes
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// Body interpreted as UTF-8, lossily
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Default)]
struct StubState {
    statuses: VecDeque<u16>,
    requests: Vec<RecordedRequest>,
}

/// Local HTTP server answering with scripted status codes
#[derive(Debug)]
pub struct StubServer {
    addr: SocketAddr,
    state: Arc<Mutex<StubState>>,
    task: JoinHandle<()>,
}

impl StubServer {
    /// Bind on a free loopback port and start serving.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the bind error if no port is available.
    pub async fn start(statuses: Vec<u16>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(StubState {
            statuses: statuses.into(),
            requests: Vec::new(),
        }));

        let task = tokio::spawn(serve(listener, Arc::clone(&state)));
        Ok(Self { addr, state, task })
    }

    /// `http://` root to configure a sink with
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Requests received so far, in order
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .lock()
            .map(|s| s.requests.clone())
            .unwrap_or_default()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(listener: TcpListener, state: Arc<Mutex<StubState>>) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };

        let request = match read_request(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                log::debug!("Stub server read failed: {}", e);
                continue;
            }
        };

        let status = match state.lock() {
            Ok(mut s) => {
                s.requests.push(request);
                s.statuses.pop_front().unwrap_or(200)
            }
            Err(_) => 500,
        };

        let body = if status == 200 { "ok" } else { "rejected" };
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            if status == 200 { "OK" } else { "Error" },
            body.len(),
            body
        );
        if let Err(e) = stream.write_all(response.as_bytes()).await {
            log::debug!("Stub server write failed: {}", e);
        }
        let _ = stream.shutdown().await;
    }
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<RecordedRequest>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut request_line = headers.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();

    let content_length = headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok());
    let chunked = headers
        .to_ascii_lowercase()
        .contains("transfer-encoding: chunked");

    let mut body = buf[header_end..].to_vec();
    loop {
        let complete = match content_length {
            Some(len) => body.len() >= len,
            None if chunked => body.ends_with(b"0\r\n\r\n"),
            None => true,
        };
        if complete {
            break;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    if let Some(len) = content_length {
        body.truncate(len);
    }

    Ok(Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    }))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_statuses_then_ok() {
        let server = StubServer::start(vec![503]).await.unwrap();
        let addr = server.addr;

        for expected in ["503 Error", "200 OK"] {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"POST /detect HTTP/1.1\r\nContent-Length: 4\r\n\r\nping")
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            assert!(response.starts_with(&format!("HTTP/1.1 {}", expected)));
        }

        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/detect");
        assert_eq!(requests[0].body_text(), "ping");
    }
}
