//! `/metrics` handler and text exposition rendering.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};

use ecp_metrics_core::model::ComponentInfo;
use ecp_metrics_core::{Document, SnapshotStore};

pub(crate) const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const METRIC_NAME: &str = "ecp_component_version";

pub(crate) async fn handle_metrics(State(store): State<Arc<SnapshotStore>>) -> Response {
    // Nothing published yet: empty exposition rather than an error.
    let body = store
        .current()
        .map(|document| render_metrics(&document))
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], body).into_response()
}

/// One line per component: brokers, then endpoints, then component directories.
pub(crate) fn render_metrics(document: &Document) -> String {
    let mut out = String::with_capacity(document.component_count() * 96);
    for info in document.components() {
        write_component(&mut out, info);
    }
    out
}

fn write_component(out: &mut String, info: &ComponentInfo) {
    out.push_str(METRIC_NAME);
    let labels = [
        ("code", info.code.as_str()),
        ("org", info.organization.as_str()),
        ("type", info.component_type.as_str()),
        ("version", info.implementation.version.as_str()),
    ];
    for (i, (name, value)) in labels.into_iter().enumerate() {
        out.push(if i == 0 { '{' } else { ',' });
        out.push_str(name);
        out.push_str("=\"");
        escape_label_value(out, value);
        out.push('"');
    }
    out.push_str("} 1\n");
}

fn escape_label_value(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
}
