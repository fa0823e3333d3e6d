//! # Data Retrieval Module
//!
//! Generic HTTP retrieval used by the provider clients in `markets`.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: A JSON `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, with automatic retries of transient failures. The
//!   symbol catalog and the candle history client are both layered on it.

#![forbid(unsafe_code)]

/// Generic HTTP API client with retry middleware for resilient network requests.
pub mod ky_http;

pub use ky_http::{ApiClient, ApiResponse};

#[cfg(test)]
pub(crate) mod test_support {
    //! One-shot HTTP servers for client tests.

    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Serves `responses` in order, one per connection, and returns the
    /// base URL plus a handle yielding each request line received.
    pub fn serve(responses: Vec<(u16, String)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let port = listener.local_addr().expect("local addr").port();
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    break;
                };
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                seen.push(request.lines().next().unwrap_or_default().to_string());

                let reason = if status == 200 { "OK" } else { "Error" };
                let head = format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n",
                    status,
                    reason,
                    body.len()
                );
                stream.write_all(head.as_bytes()).unwrap();
                stream.write_all(body.as_bytes()).unwrap();
                stream.flush().unwrap();
            }
            seen
        });
        (format!("http://127.0.0.1:{}/", port), handle)
    }
}
