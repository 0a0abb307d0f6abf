//! Endpoint helpers shared by the network backends

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use url::Url;

use super::base::{BackendError, BackendResult};

/// `host:port` for a `ws://`, `wss://`, `http://` or `https://` URL.
pub fn socket_address(raw: &str) -> BackendResult<String> {
    let url = Url::parse(raw)
        .map_err(|e| BackendError::Configuration(format!("invalid URL '{raw}': {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| BackendError::Configuration(format!("URL '{raw}' has no host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| BackendError::Configuration(format!("URL '{raw}' has no port")))?;
    Ok(format!("{host}:{port}"))
}

/// Whether a TCP connection to the URL's endpoint succeeds within `limit`.
pub async fn is_reachable(raw: &str, limit: Duration) -> bool {
    let Ok(addr) = socket_address(raw) else {
        return false;
    };
    matches!(timeout(limit, TcpStream::connect(&addr)).await, Ok(Ok(_)))
}

/// Fail with a connection error unless the endpoint accepts TCP.
pub async fn ensure_reachable(raw: &str, limit: Duration) -> BackendResult<()> {
    let addr = socket_address(raw)?;
    match timeout(limit, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(BackendError::Connection(format!("{addr}: {e}"))),
        Err(_) => Err(BackendError::Connection(format!(
            "{addr}: timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// Poll until `addr` accepts TCP connections or `limit` elapses.
pub async fn wait_for_port(addr: &str, limit: Duration) -> BackendResult<()> {
    let deadline = Instant::now() + limit;
    loop {
        if TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(BackendError::NotReady(format!(
                "{addr} not accepting connections after {}s",
                limit.as_secs()
            )));
        }
        sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_socket_address() {
        assert_eq!(socket_address("ws://127.0.0.1:2700").unwrap(), "127.0.0.1:2700");
        assert_eq!(socket_address("http://localhost").unwrap(), "localhost:80");
        assert_eq!(socket_address("wss://example.org/asr").unwrap(), "example.org:443");
        assert!(socket_address("not a url").is_err());
    }

    #[tokio::test]
    async fn test_reachability() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("ws://127.0.0.1:{port}");

        assert!(is_reachable(&url, Duration::from_millis(500)).await);
        assert!(ensure_reachable(&url, Duration::from_millis(500)).await.is_ok());

        drop(listener);
        assert!(ensure_reachable(&url, Duration::from_millis(500)).await.is_err());
    }

    #[tokio::test]
    async fn test_wait_for_port_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = wait_for_port(&addr, Duration::from_millis(250)).await;
        assert!(matches!(result, Err(BackendError::NotReady(_))));
    }
}
