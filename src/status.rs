use crate::auth;
use crate::dispatch::{full, ProxyBody, ProxyState};
use crate::registry::ActiveRequest;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::{Response, StatusCode};
use std::fmt::Write as _;
use time::format_description::well_known::Rfc3339;

/// Answer a request addressed to the proxy's own hostname.
///
/// The page is gated on the regular `Authorization` header, not the proxy
/// credential, because here the proxy acts as an origin server.
pub fn handle(state: &ProxyState, headers: &mut HeaderMap) -> Response<ProxyBody> {
    if !auth::check_credentials(headers, &AUTHORIZATION, &state.config) {
        return unauthorized();
    }

    let page = render(env!("CARGO_PKG_VERSION"), &state.registry.snapshot());
    let mut resp = Response::new(full(page));
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    resp
}

fn unauthorized() -> Response<ProxyBody> {
    let mut resp = Response::new(full("Unauthorized\n"));
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp.headers_mut().insert(
        WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"proxy\""),
    );
    resp
}

/// Render the status page: version banner plus one table row per in-flight
/// request.
fn render(version: &str, active: &[ActiveRequest]) -> String {
    let mut page = String::with_capacity(512 + active.len() * 160);
    page.push_str("<!DOCTYPE html>\n<html>\n<head><title>Status</title></head>\n<body>\n");
    let _ = writeln!(page, "<p>porterd {}</p>", escape(version));
    page.push_str(
        "<table>\n<tr><td>ReqID</td><td>Timestamp</td><td>Method</td>\
<td>UpClosed</td><td>DownClosed</td><td>URL</td></tr>\n",
    );
    for entry in active {
        let timestamp = entry.timestamp.format(&Rfc3339).unwrap_or_default();
        let _ = writeln!(
            page,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            entry.id,
            timestamp,
            escape(&entry.method),
            entry.up_closed,
            entry.down_closed,
            escape(&entry.url),
        );
    }
    page.push_str("</table>\n</body>\n</html>\n");
    page
}

/// Minimal HTML escaping for request-supplied strings.
fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
