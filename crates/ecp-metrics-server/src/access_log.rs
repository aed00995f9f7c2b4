//! Access log on top of tower-http's `TraceLayer`.
//!
//! Each request gets a `request` span carrying method, path and client
//! address; the response is logged once inside it with status, latency and
//! the bearer auth outcome when `/metrics` was routed.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request};
use axum::response::Response;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::TraceLayer;
use tracing::{Span, info, info_span};

use crate::auth::AuthOutcome;

pub(crate) type AccessLogLayer = TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    fn(&Request) -> Span,
    (),
    fn(&Response, Duration, &Span),
>;

pub(crate) fn layer() -> AccessLogLayer {
    TraceLayer::new_for_http()
        .make_span_with(make_span as fn(&Request) -> Span)
        .on_request(())
        .on_response(log_response as fn(&Response, Duration, &Span))
}

fn make_span(req: &Request) -> Span {
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_owned());
    info_span!(
        "request",
        method = %req.method(),
        path = %req.uri().path(),
        client = %client,
    )
}

fn log_response(response: &Response, latency: Duration, _span: &Span) {
    let status = response.status().as_u16();
    let latency_ms = latency.as_millis() as u64;
    match response.extensions().get::<AuthOutcome>() {
        Some(outcome) => info!(status, latency_ms, auth = outcome.as_str(), "served request"),
        None => info!(status, latency_ms, "served request"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::body::Body;
    use axum::http::{StatusCode, header};
    use tower::ServiceExt;
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::registry::LookupSpan;

    use ecp_metrics_core::SnapshotStore;

    use crate::auth::BearerToken;
    use crate::exporter::build_router;

    /// Fields of every event, plus the fields of the span it was emitted in.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<Vec<(String, String)>>>>);

    #[derive(Default)]
    struct Fields(Vec<(String, String)>);

    impl Visit for Fields {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.push((field.name().to_owned(), format!("{value:?}")));
        }

        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.push((field.name().to_owned(), value.to_owned()));
        }
    }

    impl<S> tracing_subscriber::Layer<S> for Captured
    where
        S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    {
        fn on_new_span(
            &self,
            attrs: &tracing::span::Attributes<'_>,
            id: &tracing::span::Id,
            ctx: Context<'_, S>,
        ) {
            let mut fields = Fields::default();
            attrs.record(&mut fields);
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(fields);
            }
        }

        fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
            let mut fields = Fields::default();
            event.record(&mut fields);
            if let Some(span) = ctx.event_span(event) {
                if let Some(span_fields) = span.extensions().get::<Fields>() {
                    fields.0.extend(span_fields.0.iter().cloned());
                }
            }
            self.0.lock().unwrap().push(fields.0);
        }
    }

    impl Captured {
        fn access_lines(&self) -> Vec<Vec<(String, String)>> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|fields| {
                    fields
                        .iter()
                        .any(|(k, v)| k == "message" && v == "served request")
                })
                .cloned()
                .collect()
        }
    }

    fn field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    async fn send(router: Router, path: &str, authorization: Option<&str>) -> StatusCode {
        let mut req = axum::http::Request::builder().uri(path);
        if let Some(value) = authorization {
            req = req.header(header::AUTHORIZATION, value);
        }
        router
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn logs_one_line_per_request_with_auth_outcome() {
        let captured = Captured::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(captured.clone()));

        let router = build_router(
            Arc::new(SnapshotStore::new()),
            Arc::new(BearerToken::new("t0ken")),
        );
        assert_eq!(send(router.clone(), "/metrics", Some("Bearer t0ken")).await, StatusCode::OK);
        assert_eq!(
            send(router.clone(), "/metrics", Some("Bearer nope")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(send(router.clone(), "/metrics", None).await, StatusCode::UNAUTHORIZED);
        assert_eq!(send(router, "/other", None).await, StatusCode::NOT_FOUND);

        let lines = captured.access_lines();
        assert_eq!(lines.len(), 4);
        let summary: Vec<_> = lines
            .iter()
            .map(|l| (field(l, "status"), field(l, "auth"), field(l, "path")))
            .collect();
        assert_eq!(
            summary,
            [
                (Some("200"), Some("accepted"), Some("/metrics")),
                (Some("401"), Some("invalid_token"), Some("/metrics")),
                (Some("401"), Some("missing_credential"), Some("/metrics")),
                (Some("404"), None, Some("/other")),
            ]
        );
        for line in &lines {
            assert_eq!(field(line, "method"), Some("GET"));
            // No ConnectInfo on oneshot requests.
            assert_eq!(field(line, "client"), Some("-"));
            assert!(field(line, "latency_ms").is_some());
        }
    }
}
