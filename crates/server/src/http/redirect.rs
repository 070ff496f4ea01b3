//! Plain HTTP listener handler
//!
//! Answers ACME HTTP-01 challenges and redirects everything else to HTTPS
//! with `302 Found`. The query string is not carried over.

use bytes::Bytes;
use http::{header, HeaderValue, Request, Response, StatusCode};
use http_body_util::Full;
use tracing::{debug, trace};

use super::{request_host, status_response, Body};
use crate::acme::ChallengeManager;

/// Handle one request on the plain HTTP listener.
pub fn handle<B>(req: &Request<B>, challenges: &ChallengeManager) -> Response<Body> {
    let path = req.uri().path();

    if let Some(token) = ChallengeManager::token_from_path(path) {
        return match challenges.key_authorization(token) {
            Some(key_authorization) => {
                debug!(token = %token, "Serving ACME challenge response");
                let mut response = Response::new(Full::new(key_authorization));
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/octet-stream"),
                );
                response
            }
            None => status_response(StatusCode::NOT_FOUND),
        };
    }

    let Some(host) = request_host(req) else {
        return status_response(StatusCode::BAD_REQUEST);
    };

    let location = format!("https://{}{}", host, path);
    let Ok(location) = HeaderValue::try_from(location) else {
        return status_response(StatusCode::BAD_REQUEST);
    };

    trace!(location = ?location, "Redirecting to HTTPS");
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::FOUND;
    response.headers_mut().insert(header::LOCATION, location);
    response
}
