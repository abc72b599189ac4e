use std::path::Path;

use log::debug;
use reqwest::{Certificate, Client};
use thiserror::Error;
use tokio::time::Duration;
use url::Url;

use crate::models::CompletedRecord;

/// Header carrying the stream's private (posting) key.
pub const PRIVATE_KEY_HEADER: &str = "Phant-Private-Key";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Missing or empty {0}")]
    MissingCredentials(&'static str),
    #[error("Invalid upload endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("HTTP code {status}: {body}")]
    RemoteRejected { status: u16, body: String },
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Keys of the collector stream records are posted to.
#[derive(Clone)]
pub struct StreamKeys {
    pub public_key: String,
    pub private_key: String,
}

impl std::fmt::Debug for StreamKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("StreamKeys")
            .field("public_key", &self.public_key)
            .field("private_key", &"<elided>")
            .finish()
    }
}

/// Build the HTTPS client, optionally trusting an extra CA certificate
///
/// # Arguments
/// * `ca_cert_path` - PEM file for a self-hosted collector
/// * `request_timeout` - Bound on each upload request
pub fn create_http_client(
    ca_cert_path: Option<&Path>,
    request_timeout: Duration,
) -> Result<Client, UploadError> {
    let mut builder = Client::builder().timeout(request_timeout);

    if let Some(path) = ca_cert_path {
        let pem = std::fs::read(path).map_err(|e| {
            UploadError::InvalidEndpoint(format!("Error loading CA cert {}: {}", path.display(), e))
        })?;
        let cert = Certificate::from_pem(&pem)
            .map_err(|e| UploadError::InvalidEndpoint(format!("Error parsing CA cert: {}", e)))?;
        builder = builder.add_root_certificate(cert);
    }

    builder
        .build()
        .map_err(|e| UploadError::InvalidEndpoint(format!("HTTP client error: {}", e)))
}

/// Posts completed records to the data collector.
#[derive(Debug, Clone)]
pub struct UploadClient {
    http: Client,
    base_url: Url,
}

impl UploadClient {
    pub fn new(http: Client, base_url: Url) -> Self {
        UploadClient { http, base_url }
    }

    /// Target URL for one record: `/input/{publicKey}?total_kg=..&ul_kg=..`
    ///
    /// The key and every field name and value are percent-encoded
    /// individually.
    pub fn input_url(&self, public_key: &str, record: &CompletedRecord) -> Result<Url, UploadError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| UploadError::InvalidEndpoint(self.base_url.to_string()))?
            .pop_if_empty()
            .push("input")
            .push(public_key);

        url.set_query(None);
        {
            let mut query = url.query_pairs_mut();
            for (name, value) in record.fields() {
                query.append_pair(name, &value.to_string());
            }
        }
        Ok(url)
    }

    /// Send one record
    ///
    /// Credentials are checked before any network I/O. The private key
    /// travels only in [`PRIVATE_KEY_HEADER`], never in the URL. There is
    /// no retry here: a failed upload drops the sample and the next
    /// session's record supersedes it.
    ///
    /// # Returns
    /// `Ok` for status 100..=299, otherwise the rejection or transport failure
    pub async fn send(&self, keys: &StreamKeys, record: &CompletedRecord) -> Result<(), UploadError> {
        if keys.public_key.is_empty() {
            return Err(UploadError::MissingCredentials("publicKey"));
        }
        if keys.private_key.is_empty() {
            return Err(UploadError::MissingCredentials("privateKey"));
        }

        let url = self.input_url(&keys.public_key, record)?;
        debug!("path: {}?{}", url.path(), url.query().unwrap_or_default());

        let response = self
            .http
            .post(url)
            .header(PRIVATE_KEY_HEADER, &keys.private_key)
            .send()
            .await
            .map_err(|e| UploadError::TransportError(e.to_string()))?;

        let status = response.status().as_u16();
        if (100..=299).contains(&status) {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("<unreadable body: {}>", e));
        Err(UploadError::RemoteRejected { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use time::OffsetDateTime;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn record() -> CompletedRecord {
        CompletedRecord {
            total_kg: 80.0,
            upper_left_kg: 20.5,
            upper_right_kg: 19.5,
            lower_left_kg: 20.0,
            lower_right_kg: 20.0,
            measured_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn keys(private_key: &str) -> StreamKeys {
        StreamKeys {
            public_key: "pubkey".to_string(),
            private_key: private_key.to_string(),
        }
    }

    fn client(base: &str) -> UploadClient {
        let http = create_http_client(None, Duration::from_secs(5)).unwrap();
        UploadClient::new(http, Url::parse(base).unwrap())
    }

    /// Accept one connection, answer it with `response`, return the request head.
    async fn respond_once(response: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (base, task)
    }

    #[test]
    fn url_carries_key_and_fields_in_order() {
        let url = client("https://data.sparkfun.com")
            .input_url("pubkey", &record())
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://data.sparkfun.com/input/pubkey?total_kg=80&ul_kg=20.5&ur_kg=19.5&ll_kg=20&lr_kg=20"
        );
    }

    #[test]
    fn public_key_is_percent_encoded() {
        let url = client("https://collector.example/base/")
            .input_url("my key/1", &record())
            .unwrap();
        assert_eq!(url.path(), "/base/input/my%20key%2F1");
    }

    #[test]
    fn empty_private_key_fails_without_io() {
        let client = client("http://collector.invalid");
        let result = client
            .send(&keys(""), &record())
            .now_or_never()
            .expect("credential check must not wait on the network");
        assert!(matches!(
            result,
            Err(UploadError::MissingCredentials("privateKey"))
        ));
    }

    #[test]
    fn empty_public_key_fails_without_io() {
        let client = client("http://collector.invalid");
        let keys = StreamKeys {
            public_key: String::new(),
            private_key: "secret".to_string(),
        };
        let result = client.send(&keys, &record()).now_or_never().unwrap();
        assert!(matches!(
            result,
            Err(UploadError::MissingCredentials("publicKey"))
        ));
    }

    #[tokio::test]
    async fn success_posts_private_key_in_header() {
        let (base, server) =
            respond_once("HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\n1 success\r\n")
                .await;

        client(&base).send(&keys("secret"), &record()).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /input/pubkey?total_kg=80&ul_kg=20.5"));
        assert!(request
            .to_ascii_lowercase()
            .contains("phant-private-key: secret"));
        assert!(!request.lines().next().unwrap().contains("secret"));
    }

    #[tokio::test]
    async fn unauthorized_is_rejected_with_body() {
        let (base, server) = respond_once(
            "HTTP/1.1 401 Unauthorized\r\nContent-Length: 18\r\nConnection: close\r\n\r\nforbidden: bad key",
        )
        .await;

        let err = client(&base)
            .send(&keys("wrong"), &record())
            .await
            .unwrap_err();
        server.await.unwrap();

        match err {
            UploadError::RemoteRejected { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "forbidden: bad key");
            }
            other => panic!("expected RemoteRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = client(&base)
            .send(&keys("secret"), &record())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TransportError(_)));
    }
}
