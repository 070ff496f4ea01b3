//! HTTP request handling
//!
//! - [`StaticFiles`] - The HTTPS handler: per-domain static files
//! - [`redirect`] - The plain HTTP handler: ACME challenges and redirects

pub mod redirect;
mod static_files;

use bytes::Bytes;
use http::{header, Request, Response, StatusCode};
use http_body_util::Full;

pub use static_files::StaticFiles;

/// Response body type of both listeners
pub type Body = Full<Bytes>;

/// Host the client asked for: the `Host` header, else the URI authority.
pub fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().authority().map(|authority| authority.as_str()))
        .filter(|host| !host.is_empty())
}

/// Strip a trailing `:port` from a host, keeping IPv6 brackets.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Plain-text error response that cannot fail to build.
pub(crate) fn status_response(status: StatusCode) -> Response<Body> {
    let text = match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    };
    let mut response = Response::new(Full::new(Bytes::from(text)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain"),
    );
    response
}
