//! Reachability probe gating all network work in a cycle.

use std::time::Duration;

use log::debug;
use reqwest::Client;

use crate::error::{CaptureError, Result};

/// Cheap "is the network up" predicate. No retries of its own.
#[allow(async_fn_in_trait)]
pub trait ConnectivityProbe {
    async fn is_online(&self) -> bool;
}

/// Probes a well-known endpoint with a short timeout. Any HTTP response,
/// whatever its status, counts as online.
pub struct HttpConnectivityGate {
    client: Client,
    url: String,
}

impl HttpConnectivityGate {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| CaptureError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl ConnectivityProbe for HttpConnectivityGate {
    async fn is_online(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) => {
                debug!("[Connectivity] {} -> {}", self.url, resp.status());
                true
            }
            Err(e) => {
                debug!("[Connectivity] {} unreachable: {}", self.url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_endpoint_is_offline() {
        // Port 9 on loopback is "discard"; nothing listens there in CI
        let gate =
            HttpConnectivityGate::new("http://127.0.0.1:9/", Duration::from_millis(500)).unwrap();
        assert!(!gate.is_online().await);
    }

    #[tokio::test]
    async fn test_any_response_is_online() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });

        let gate =
            HttpConnectivityGate::new(format!("http://{}/", addr), Duration::from_secs(2)).unwrap();
        assert!(gate.is_online().await);
    }
}
