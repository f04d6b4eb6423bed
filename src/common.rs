use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{Response, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Body type of every response the forward path produces.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Common response builder utilities
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Creates a response with the given status and a plain-text body
    pub fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let mut response = Response::new(full(message.to_string()));
        *response.status_mut() = status;
        response
    }

    /// 503 carrying the error text; used whenever the destination cannot be reached
    pub fn service_unavailable(message: &str) -> Response<ProxyBody> {
        Self::error(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal_server_error(message: &str) -> Response<ProxyBody> {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

/// Writes a minimal HTTP/1.1 response straight to a socket that hyper does not own.
///
/// The connection is announced as closing; the caller shuts it down afterwards.
pub async fn write_raw_response<W>(io: &mut W, status: StatusCode, body: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    );
    io.write_all(response.as_bytes()).await?;
    io.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_service_unavailable_carries_message() {
        let response = ResponseBuilder::service_unavailable("dial 10.0.0.1:80 failed");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"dial 10.0.0.1:80 failed");
    }

    #[tokio::test]
    async fn test_raw_response_format() {
        let (mut writer, mut reader) = tokio::io::duplex(256);
        write_raw_response(&mut writer, StatusCode::BAD_REQUEST, "bad head").await.unwrap();
        drop(writer);

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(out.contains("Content-Length: 8\r\n"));
        assert!(out.ends_with("\r\n\r\nbad head"));
    }
}
