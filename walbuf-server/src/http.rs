//! Response builders and request helpers shared by the HTTP listeners.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::borrow::Cow;

/// Response type produced by every handler.
pub type HttpResponse = Response<Full<Bytes>>;

/// Builds a plain-text response.
pub fn text_response(status: StatusCode, body: &'static str) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Builds a JSON response, degrading to a 500 if the body cannot be encoded.
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> HttpResponse {
    let json = match serde_json::to_vec(body) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to encode response body: {}", e);
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Returns the percent-decoded value of the first `key` parameter in a
/// query string. `+` is treated as a space, as in HTML form encoding.
pub fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<Cow<'a, str>> {
    query?
        .split('&')
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| {
            if v.contains('+') {
                let spaced = v.replace('+', " ");
                let decoded = urlencoding::decode(&spaced).map(Cow::into_owned);
                Cow::Owned(decoded.unwrap_or(spaced))
            } else {
                urlencoding::decode(v).unwrap_or(Cow::Borrowed(v))
            }
        })
}
