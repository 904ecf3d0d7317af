use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use common::{Frame, FrameKind, StreamConfig};

use crate::errors::NetworkError;

/// Delivers one frame to the ingest server.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    async fn send(&self, frame: &Frame) -> Result<(), NetworkError>;
}

/// Plain HTTP POST per frame, one request per payload.
pub struct HttpTransport {
    client: reqwest::Client,
    frame_url: String,
    audio_url: String,
    read_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &StreamConfig, connect_timeout: Duration, read_timeout: Duration) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .map_err(|e| NetworkError::ClientBuild { message: e.to_string() })?;

        Ok(Self {
            client,
            frame_url: config.upload_url(FrameKind::Image),
            audio_url: config.upload_url(FrameKind::Audio),
            read_timeout,
        })
    }

    fn url_for(&self, kind: FrameKind) -> &str {
        match kind {
            FrameKind::Image => &self.frame_url,
            FrameKind::Audio => &self.audio_url,
        }
    }
}

#[async_trait]
impl FrameTransport for HttpTransport {
    async fn send(&self, frame: &Frame) -> Result<(), NetworkError> {
        let url = self.url_for(frame.kind);

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, frame.kind.content_type())
            .header(CONTENT_LENGTH, frame.len())
            .body(frame.payload.clone())
            .send()
            .await
            .map_err(|e| NetworkError::from_reqwest(url, self.read_timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        trace!("Uploaded {} bytes of {} to {}", frame.len(), frame.kind, url);
        Ok(())
    }
}

/// Check that something is listening on `host:port`.
///
/// Returns the time the TCP handshake took.
pub async fn probe_server(host: &str, port: u16, timeout: Duration) -> Result<Duration, NetworkError> {
    let address = format!("{}:{}", host, port);
    let started = Instant::now();

    match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
        Ok(Ok(_stream)) => {
            let elapsed = started.elapsed();
            debug!("Probe of {} succeeded in {:?}", address, elapsed);
            Ok(elapsed)
        }
        Ok(Err(e)) => Err(NetworkError::Unreachable {
            address,
            message: e.to_string(),
        }),
        Err(_) => Err(NetworkError::Timeout {
            url: address,
            duration: timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Mode, Quality};

    #[tokio::test]
    async fn test_probe_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let rtt = probe_server("127.0.0.1", port, Duration::from_secs(2)).await.unwrap();
        assert!(rtt < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_probe_reports_refused_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = probe_server("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(NetworkError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = StreamConfig::new(Mode::ImageOnly, Quality::Low480p, "127.0.0.1", port).unwrap();
        let transport = HttpTransport::new(&config, Duration::from_secs(1), Duration::from_secs(1)).unwrap();

        let error = transport.send(&Frame::image(vec![0xFF, 0xD8, 0xFF, 0xD9])).await.unwrap_err();
        assert!(error.is_transport_failure(), "unexpected {:?}", error);
    }
}
