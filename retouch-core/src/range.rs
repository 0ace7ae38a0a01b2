use anyhow::Context;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};

use crate::http::http_client;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteFile {
    pub content_length: u64,
    pub supports_ranges: bool,
}

pub async fn probe(url: &str) -> anyhow::Result<RemoteFile> {
    let response = http_client()
        .head(url)
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("cannot reach {url}"))?;
    let headers = response.headers();

    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .context("missing Content-Length header")?;

    let supports_ranges = headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

    Ok(RemoteFile {
        content_length,
        supports_ranges,
    })
}

pub async fn fetch_range(url: &str, start: u64, end_inclusive: u64) -> anyhow::Result<Vec<u8>> {
    let response = http_client()
        .get(url)
        .header(RANGE, format!("bytes={start}-{end_inclusive}"))
        .send()
        .await?;

    if response.status() != reqwest::StatusCode::PARTIAL_CONTENT {
        anyhow::bail!("server did not honor range: {}", response.status());
    }

    let bytes = response.bytes().await?.to_vec();
    let expected = usize::try_from(end_inclusive - start + 1)?;
    anyhow::ensure!(
        bytes.len() == expected,
        "range returned {} bytes (expected {expected})",
        bytes.len()
    );

    Ok(bytes)
}

/// Plain GET; the body is left for the caller to stream.
pub async fn get_whole(url: &str) -> anyhow::Result<reqwest::Response> {
    let response = http_client()
        .get(url)
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("cannot download {url}"))?;
    Ok(response)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use tokio::sync::oneshot;

    use super::{fetch_range, get_whole, probe};

    #[derive(Clone)]
    struct Served {
        bytes: Arc<Vec<u8>>,
        ranges: bool,
    }

    async fn head_handler(State(state): State<Served>) -> impl IntoResponse {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&state.bytes.len().to_string()).expect("valid content length"),
        );
        if state.ranges {
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        }
        (StatusCode::OK, headers)
    }

    fn requested_range(headers: &HeaderMap, len: usize) -> Option<(usize, usize)> {
        let range = headers.get(header::RANGE)?.to_str().ok()?;
        let (start, end) = range.strip_prefix("bytes=")?.split_once('-')?;
        let start = start.parse::<usize>().ok()?;
        let end = end.parse::<usize>().ok()?.min(len.saturating_sub(1));
        (start <= end && start < len).then_some((start, end))
    }

    async fn get_handler(State(state): State<Served>, headers: HeaderMap) -> impl IntoResponse {
        if state.ranges
            && let Some((start, end)) = requested_range(&headers, state.bytes.len())
        {
            return (StatusCode::PARTIAL_CONTENT, state.bytes[start..=end].to_vec()).into_response();
        }
        (StatusCode::OK, state.bytes.to_vec()).into_response()
    }

    /// Serves `bytes` at `/{name}`; the returned sender shuts the server down.
    pub(crate) async fn serve(
        name: &str,
        bytes: Vec<u8>,
        ranges: bool,
    ) -> (String, oneshot::Sender<()>) {
        let state = Served {
            bytes: Arc::new(bytes),
            ranges,
        };
        let app = Router::new()
            .route(&format!("/{name}"), get(get_handler).head(head_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("serve test app");
        });

        (format!("http://{addr}/{name}"), shutdown_tx)
    }

    #[tokio::test]
    async fn probe_and_range_requests() {
        let (url, shutdown) = serve("file", b"0123456789abcdef".to_vec(), true).await;

        let remote = probe(&url).await.expect("probe should succeed");
        assert_eq!(remote.content_length, 16);
        assert!(remote.supports_ranges);

        let chunk = fetch_range(&url, 2, 5).await.expect("range should succeed");
        assert_eq!(chunk, b"2345");

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn range_fails_when_server_ignores_it() {
        let (url, shutdown) = serve("file", b"abcdef".to_vec(), false).await;

        let remote = probe(&url).await.expect("probe should succeed");
        assert!(!remote.supports_ranges);

        let err = fetch_range(&url, 0, 2)
            .await
            .expect_err("range must fail without partial content");
        assert!(
            err.to_string().contains("server did not honor range"),
            "unexpected error: {err:#}"
        );

        let whole = get_whole(&url)
            .await
            .expect("plain GET should succeed")
            .bytes()
            .await
            .expect("body should arrive");
        assert_eq!(whole.as_ref(), b"abcdef");

        let _ = shutdown.send(());
    }
}
