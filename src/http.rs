use std::net::SocketAddr;

use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, StatusCode, Uri, Version};

pub use hyper::body::Bytes;

/// Header names of the negotiation protocol.
///
/// Stored lowercase as `HeaderMap` keys; the server emits them title-cased
/// (`Original-Encrypt`, ...) when `http1_title_case_headers` is on.
pub mod names {
    /// Ordered encryption chain, one code per step.
    pub const ORIGINAL_ENCRYPT: &str = "original-encrypt";
    /// Base64 of the RSA-wrapped per-message key of the hybrid step.
    pub const ENCRYPT_KEY: &str = "encrypt-key";
    /// Compression kind code, `0..=4`.
    pub const ORIGINAL_ENCODING: &str = "original-encoding";
    /// Pre-compression length, sent with LZ4.
    pub const ORIGINAL_LENGTH: &str = "original-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
}

/// The verb a handler is invoked with. Anything but POST is served as GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Post => "post",
        }
    }
}

impl From<&Method> for Verb {
    fn from(method: &Method) -> Self {
        if *method == Method::POST {
            Verb::Post
        } else {
            Verb::Get
        }
    }
}

/// A complete request as delivered by the transport.
///
/// The body has already been read in full; nothing downstream of the
/// transport blocks on I/O.
///
/// ```
/// # use sheath::InboundRequest;
/// let request = InboundRequest::get("/index?id=7");
/// assert_eq!(request.path(), "/index");
/// assert_eq!(request.query(), Some("id=7"));
/// ```
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer_addr: Option<SocketAddr>,
}

impl InboundRequest {
    /// Builds an HTTP/1.1 request with no headers. Unparsable URIs become `/`.
    pub fn new(method: Method, uri: &str) -> Self {
        InboundRequest {
            method,
            uri: uri.parse().unwrap_or_else(|_| Uri::from_static("/")),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            peer_addr: None,
        }
    }

    pub fn get(uri: &str) -> Self {
        InboundRequest::new(Method::GET, uri)
    }

    pub fn post(uri: &str, body: impl Into<Bytes>) -> Self {
        InboundRequest::new(Method::POST, uri).with_body(body)
    }

    pub fn from_parts(parts: hyper::http::request::Parts, body: Bytes, peer_addr: Option<SocketAddr>) -> Self {
        InboundRequest {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
            peer_addr,
        }
    }

    /// Adds a header, ignoring values that are not valid header text.
    pub fn with_header(mut self, name: &'static str, value: impl AsRef<str>) -> Self {
        if let Ok(value) = HeaderValue::from_str(value.as_ref()) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the client asked to keep the connection open.
    ///
    /// HTTP/1.0 needs an explicit `Connection: keep-alive`; later versions keep
    /// the connection unless `Connection: close` is present.
    pub fn wants_keep_alive(&self) -> bool {
        let has_token = |token: &str| {
            self.headers
                .get_all(header::CONNECTION)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        };

        if matches!(self.version, Version::HTTP_09 | Version::HTTP_10) {
            has_token("keep-alive")
        } else {
            !has_token("close")
        }
    }
}

/// A complete response handed back to the transport.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// When false the transport closes the connection after writing.
    pub keep_alive: bool,
}

impl OutboundResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        OutboundResponse {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            keep_alive: true,
        }
    }

    /// An empty 500 that asks the transport to drop the connection.
    pub fn internal_error() -> Self {
        let mut response = OutboundResponse::new(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new());
        response.close();
        response
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Marks the connection to be closed after this response.
    pub fn close(&mut self) {
        self.keep_alive = false;
        self.headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
    }

    /// Converts into a hyper response; hyper derives `Content-Length` from the body.
    pub fn into_hyper(self) -> hyper::Response<hyper::Body> {
        let mut response = hyper::Response::new(hyper::Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        if !self.keep_alive {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests the keep-alive rules for HTTP/1.0 and HTTP/1.1 requests.
    #[test]
    fn test_keep_alive_negotiation() {
        let http11 = InboundRequest::get("/");
        assert!(http11.wants_keep_alive());

        let http11_close = InboundRequest::get("/").with_header("connection", "close");
        assert!(!http11_close.wants_keep_alive());

        let http10 = InboundRequest::get("/").with_version(Version::HTTP_10);
        assert!(!http10.wants_keep_alive());

        let http10_keep = InboundRequest::get("/")
            .with_version(Version::HTTP_10)
            .with_header("connection", "Keep-Alive");
        assert!(http10_keep.wants_keep_alive());
    }

    #[test]
    fn test_verb_mapping() {
        assert_eq!(Verb::from(&Method::POST), Verb::Post);
        assert_eq!(Verb::from(&Method::GET), Verb::Get);
        assert_eq!(Verb::from(&Method::PUT), Verb::Get);
        assert_eq!(Verb::from(&Method::DELETE), Verb::Get);
    }

    /// Tests that a closing response carries `Connection: close` through to hyper.
    #[test]
    fn test_into_hyper() {
        let mut response = OutboundResponse::new(StatusCode::NOT_FOUND, "missing");
        response.close();
        let response = response.into_hyper();

        assert_eq!(response.status(), 404);
        assert_eq!(response.headers().get("connection").unwrap(), "close");
    }

    #[test]
    fn test_request_accessors() {
        let request = InboundRequest::post("/echo?name=x", "body")
            .with_header(names::CONTENT_TYPE, "application/json");
        assert_eq!(request.path(), "/echo");
        assert_eq!(request.query(), Some("name=x"));
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(&request.body[..], b"body");
    }
}
