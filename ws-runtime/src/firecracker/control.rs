//! Client for the Firecracker API socket.

use std::path::Path;
use std::time::Duration;

use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("no response from {0} within {1:?}")]
    Timeout(String, Duration),
}

impl From<ApiError> for ws_core::Error {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Timeout(..) => ws_core::Error::Timeout(err.to_string()),
            other => ws_core::Error::Runtime(format!("firecracker API: {}", other)),
        }
    }
}

#[derive(Serialize)]
struct Action {
    action_type: &'static str,
}

pub struct FirecrackerClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl FirecrackerClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().to_string(),
            client: Client::unix(),
        }
    }

    /// Ask the guest to shut down (delivered as Ctrl+Alt+Del).
    pub async fn send_ctrl_alt_del(&self) -> Result<(), ApiError> {
        self.put(
            "/actions",
            &Action {
                action_type: "SendCtrlAltDel",
            },
        )
        .await
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        let body = serde_json::to_vec(body)?;
        let uri = Uri::new(&self.socket_path, path);
        debug!(socket = %self.socket_path, path, "PUT request to firecracker API");

        let request = Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Body::from(body))?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| ApiError::Timeout(self.socket_path.clone(), REQUEST_TIMEOUT))??;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = hyper::body::to_bytes(response.into_body()).await?;
        let message = String::from_utf8_lossy(&body).trim().to_string();
        error!(status = %status, message = %message, "firecracker API error");
        Err(ApiError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    /// Answer one request with a canned response and hand back what was received.
    async fn serve_once(listener: UnixListener, reply: &'static str) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let mut request = Vec::new();
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            if n == 0 || String::from_utf8_lossy(&request).ends_with('}') {
                break;
            }
        }
        stream.write_all(reply.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
        String::from_utf8_lossy(&request).to_string()
    }

    #[tokio::test]
    async fn test_ctrl_alt_del_request() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("firecracker.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(serve_once(
            listener,
            "HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n",
        ));

        FirecrackerClient::new(&socket)
            .send_ctrl_alt_del()
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("PUT /actions HTTP/1.1\r\n"));
        assert!(request
            .to_ascii_lowercase()
            .contains("content-type: application/json"));
        assert!(request.ends_with("{\"action_type\":\"SendCtrlAltDel\"}"));
    }

    #[tokio::test]
    async fn test_api_error_carries_status_and_fault() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("firecracker.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(serve_once(
            listener,
            "HTTP/1.1 400 Bad Request\r\nContent-Length: 33\r\nConnection: close\r\n\r\n{\"fault_message\":\"not supported\"}",
        ));

        let err = FirecrackerClient::new(&socket)
            .send_ctrl_alt_del()
            .await
            .unwrap_err();
        match err {
            ApiError::Api { status, message } => {
                assert_eq!(status, 400);
                assert!(message.contains("not supported"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_socket_is_http_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FirecrackerClient::new(dir.path().join("absent.sock"))
            .send_ctrl_alt_del()
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Http(_)));

        let converted: ws_core::Error = err.into();
        assert!(converted.to_string().contains("firecracker API"));
    }
}
