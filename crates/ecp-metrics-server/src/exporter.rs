//! HTTP exporter: router, listener and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tracing::{info, warn};

use ecp_metrics_core::SnapshotStore;

use crate::access_log;
use crate::auth::{self, BearerToken};
use crate::handlers;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ExporterError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("HTTP server failed: {0}")]
    Serve(std::io::Error),
}

/// `GET /metrics` behind bearer auth. Other paths fall through to 404
/// without an auth check.
pub(crate) fn build_router(store: Arc<SnapshotStore>, token: Arc<BearerToken>) -> Router {
    Router::new()
        .route("/metrics", get(handlers::handle_metrics))
        .route_layer(axum::middleware::from_fn_with_state(
            token,
            auth::bearer_auth_middleware,
        ))
        .with_state(store)
        .layer(access_log::layer())
        .layer(CompressionLayer::new())
}

pub(crate) async fn bind(addr: &str) -> Result<TcpListener, ExporterError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ExporterError::Bind {
            addr: addr.to_owned(),
            source,
        })
}

/// Serves `router` until `cancel` fires, then gives in-flight requests up to
/// `grace` to complete.
///
/// Returns an error only when the server stops on its own.
pub(crate) async fn serve(
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
    grace: Duration,
) -> Result<(), ExporterError> {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "starting server"),
        Err(_) => info!("starting server"),
    }

    let shutdown = cancel.clone();
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .into_future();
    tokio::pin!(server);

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        result = &mut server => {
            return match result {
                // Graceful shutdown can complete before this select observes the token.
                Ok(()) if cancel.is_cancelled() => {
                    info!("server stopped");
                    Ok(())
                }
                Ok(()) => Err(ExporterError::Serve(std::io::Error::other(
                    "server stopped unexpectedly",
                ))),
                Err(e) => Err(ExporterError::Serve(e)),
            };
        }
    }

    info!("shutting down server");
    match tokio::time::timeout(grace, server).await {
        Ok(Ok(())) => info!("server stopped"),
        Ok(Err(e)) => warn!(error = %e, "server failed while draining connections"),
        Err(_) => warn!(
            grace_ms = grace.as_millis() as u64,
            "in-flight requests did not complete in time, closing"
        ),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use chrono::{DateTime, Utc};
    use ecp_metrics_core::Document;
    use ecp_metrics_core::model::{Broker, ComponentInfo, Implementation, Restriction};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    const TOKEN: &str = "t0ken";

    fn broker(code: &str) -> Broker {
        Broker {
            info: ComponentInfo {
                organization: "ACME".to_string(),
                person: String::new(),
                email: String::new(),
                code: code.to_string(),
                component_type: "BROKER".to_string(),
                networks: Vec::new(),
                urls: Vec::new(),
                certificates: Vec::new(),
                created_at: DateTime::<Utc>::UNIX_EPOCH,
                modified_at: DateTime::<Utc>::UNIX_EPOCH,
                component_directory: String::new(),
                implementation: Implementation {
                    version: "4.2.0".to_string(),
                    ..Implementation::default()
                },
            },
            restriction: Restriction::default(),
        }
    }

    fn router(store: Arc<SnapshotStore>) -> Router {
        build_router(store, Arc::new(BearerToken::new(TOKEN)))
    }

    async fn request(
        router: Router,
        path: &str,
        authorization: Option<&str>,
    ) -> (StatusCode, axum::http::HeaderMap, String) {
        let mut req = Request::builder().uri(path);
        if let Some(value) = authorization {
            req = req.header(header::AUTHORIZATION, value);
        }
        let response = router
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn serves_published_document() {
        let store = Arc::new(SnapshotStore::new());
        store.replace(Document {
            brokers: vec![broker("B1")],
            ..Document::default()
        });
        let (status, headers, body) =
            request(router(store), "/metrics", Some("Bearer t0ken")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], handlers::METRICS_CONTENT_TYPE);
        assert_eq!(
            body,
            "ecp_component_version{code=\"B1\",org=\"ACME\",type=\"BROKER\",version=\"4.2.0\"} 1\n"
        );
    }

    #[tokio::test]
    async fn empty_before_first_publish() {
        let store = Arc::new(SnapshotStore::new());
        let (status, _, body) = request(router(store.clone()), "/metrics", Some("Bearer t0ken")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "");

        store.replace(Document::default());
        let (status, _, body) = request(router(store), "/metrics", Some("Bearer t0ken")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "");
    }

    #[tokio::test]
    async fn rejects_missing_or_malformed_credentials() {
        for authorization in [None, Some("Basic dXNlcjpwYXNz"), Some("Bearer"), Some("bearer t0ken")] {
            let store = Arc::new(SnapshotStore::new());
            let (status, headers, body) = request(router(store), "/metrics", authorization).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{authorization:?}");
            assert_eq!(
                headers[header::WWW_AUTHENTICATE],
                r#"Bearer realm="Restricted""#
            );
            assert_eq!(
                body,
                "Unauthorized: Missing or invalid Authorization header\n"
            );
        }
    }

    #[tokio::test]
    async fn rejects_invalid_token_without_metrics() {
        let store = Arc::new(SnapshotStore::new());
        store.replace(Document {
            brokers: vec![broker("B1")],
            ..Document::default()
        });
        for authorization in ["Bearer wrong", "Bearer t0ke", "Bearer t0ken ", "Bearer "] {
            let (status, _, body) = request(router(store.clone()), "/metrics", Some(authorization)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{authorization}");
            assert_eq!(body, "Unauthorized: Invalid token\n");
            assert!(!body.contains("ecp_component_version"));
        }
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let store = Arc::new(SnapshotStore::new());
        let (status, _, _) = request(router(store.clone()), "/", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = request(router(store), "/metrics/extra", Some("Bearer t0ken")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serves_over_tcp_and_stops_on_cancel() {
        let store = Arc::new(SnapshotStore::new());
        store.replace(Document {
            brokers: vec![broker("B1")],
            ..Document::default()
        });
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(
            listener,
            router(store),
            cancel.clone(),
            Duration::from_secs(1),
        ));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nAuthorization: Bearer t0ken\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.contains("ecp_component_version{code=\"B1\""));

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_is_always_a_clean_stop() {
        for _ in 0..100 {
            let listener = bind("127.0.0.1:0").await.unwrap();
            let cancel = CancellationToken::new();
            let server = tokio::spawn(serve(
                listener,
                router(Arc::new(SnapshotStore::new())),
                cancel.clone(),
                Duration::from_secs(1),
            ));
            tokio::task::yield_now().await;
            cancel.cancel();
            let result = tokio::time::timeout(Duration::from_secs(5), server)
                .await
                .unwrap()
                .unwrap();
            assert!(result.is_ok(), "{result:?}");
        }
    }

    #[tokio::test]
    async fn bind_reports_address_in_use() {
        let taken = bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let err = bind(&addr).await.unwrap_err();
        assert!(matches!(err, ExporterError::Bind { .. }));
        assert!(err.to_string().contains(&addr));
    }
}
