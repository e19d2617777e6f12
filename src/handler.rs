//! Request handlers and the per-request state they work on.
//!
//! A [`HandlerType`] is a named factory plus the [`TransformPolicy`] of its
//! responses and a bounded pool of idle [`HandlerInstance`]s. An instance pairs
//! the user's [`Handler`] with an [`Exchange`], which holds everything that
//! belongs to the request in flight and is cleared before the instance is
//! pooled again.

use std::any::type_name;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hyper::header;
use hyper::{Method, StatusCode, Uri};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::content::ContentKind;
use crate::error::{ContentError, PoolError, PoolResult};
use crate::http::{names, Bytes, InboundRequest, Verb};
use crate::policy::TransformPolicy;
use crate::pool::{Pool, Poolable};
use crate::transform::ContentEnvelope;

/// Error type handlers may fail with.
pub type HandlerError = Box<dyn Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

/// Idle instances kept per handler type unless configured otherwise.
pub const DEFAULT_MAX_IDLE: usize = 100;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Serves the requests routed to one handler type.
///
/// Both verbs answer with the server's "not found" text unless overridden.
/// Verbs other than POST are served by [`Handler::get`].
///
/// ```
/// use sheath::{Exchange, Handler, HandlerResult};
///
/// #[derive(Default)]
/// struct Hello;
///
/// impl Handler for Hello {
///     fn get(&mut self, exchange: &mut Exchange) -> HandlerResult {
///         let name = exchange.parameter("name").unwrap_or_else(|| "world".into());
///         exchange.write_str(&format!("hello {name}"));
///         Ok(())
///     }
/// }
/// ```
pub trait Handler: Send + 'static {
    fn get(&mut self, exchange: &mut Exchange) -> HandlerResult {
        exchange.not_found(Verb::Get);
        Ok(())
    }

    fn post(&mut self, exchange: &mut Exchange) -> HandlerResult {
        exchange.not_found(Verb::Post);
        Ok(())
    }

    /// Clears any state the handler keeps between calls. Runs after every request.
    fn reset(&mut self) {}
}

/// Fallback for paths that match no route.
#[derive(Debug, Default)]
pub struct NotFound;

impl Handler for NotFound {}

/// Server facts that handlers may report back, e.g. in the "not found" text.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub default_404_info: String,
    pub port: u16,
}

impl Default for ServerInfo {
    fn default() -> Self {
        ServerInfo {
            default_404_info: "HTTP STATUS 404 Not Found".to_string(),
            port: 0,
        }
    }
}

/// What the dispatcher attaches to an exchange before invoking a handler.
#[derive(Debug)]
pub(crate) struct RequestContext {
    pub request: InboundRequest,
    pub params: Vec<(String, String)>,
    pub prefix: String,
    pub server: Arc<ServerInfo>,
}

/// The request in flight and the response being built for it.
pub struct Exchange {
    instance_id: u64,
    type_name: &'static str,
    context: Option<RequestContext>,
    body: Bytes,
    envelope: ContentEnvelope,
    request_kind: ContentKind,
    request_charset: Option<String>,
    content_kind: ContentKind,
    charset: Option<String>,
    status: StatusCode,
    response: Vec<u8>,
    written: bool,
}

impl Exchange {
    fn new(instance_id: u64, type_name: &'static str) -> Self {
        Exchange {
            instance_id,
            type_name,
            context: None,
            body: Bytes::new(),
            envelope: ContentEnvelope::default(),
            request_kind: ContentKind::default(),
            request_charset: None,
            content_kind: ContentKind::default(),
            charset: None,
            status: StatusCode::OK,
            response: Vec::new(),
            written: false,
        }
    }

    /// Attaches a request. The body stays as received until [`Exchange::set_body`].
    pub(crate) fn configure(&mut self, context: RequestContext) {
        let (kind, charset) = context
            .request
            .header(names::CONTENT_TYPE)
            .map(ContentKind::parse)
            .unwrap_or_default();
        self.request_kind = kind;
        self.request_charset = charset;
        self.content_kind = kind;
        self.body = context.request.body.clone();
        self.context = Some(context);
    }

    pub(crate) fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub(crate) fn set_envelope(&mut self, envelope: ContentEnvelope) {
        self.envelope = envelope;
    }

    /// Clears all per-request state. The response buffer keeps its capacity.
    pub fn reset(&mut self) {
        self.context = None;
        self.body = Bytes::new();
        self.envelope = ContentEnvelope::default();
        self.request_kind = ContentKind::default();
        self.request_charset = None;
        self.content_kind = ContentKind::default();
        self.charset = None;
        self.status = StatusCode::OK;
        self.response.clear();
        self.written = false;
    }

    /// Identity of the pooled instance this exchange belongs to.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn is_configured(&self) -> bool {
        self.context.is_some()
    }

    pub fn request(&self) -> Option<&InboundRequest> {
        self.context.as_ref().map(|c| &c.request)
    }

    pub fn method(&self) -> Option<&Method> {
        self.request().map(|r| &r.method)
    }

    pub fn verb(&self) -> Verb {
        self.method().map(Verb::from).unwrap_or(Verb::Get)
    }

    pub fn uri(&self) -> Option<&Uri> {
        self.request().map(|r| &r.uri)
    }

    pub fn path(&self) -> &str {
        self.request().map(InboundRequest::path).unwrap_or("")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request().and_then(|r| r.header(name))
    }

    /// `"<worker>_<sequence>"`, unique per request.
    pub fn request_prefix(&self) -> Option<&str> {
        self.context.as_ref().map(|c| c.prefix.as_str())
    }

    /// Negotiation metadata the client sent with this request.
    pub fn envelope(&self) -> &ContentEnvelope {
        &self.envelope
    }

    /// The request body with every client-side transform undone.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn body_str(&self) -> Result<&str, ContentError> {
        Ok(std::str::from_utf8(&self.body)?)
    }

    /// Maps the body to a value according to the request's content kind.
    pub fn body_value<T: DeserializeOwned>(&self) -> Result<T, ContentError> {
        self.request_kind.decode_value(&self.body)
    }

    pub fn request_content_kind(&self) -> ContentKind {
        self.request_kind
    }

    pub fn request_charset(&self) -> Option<&str> {
        self.request_charset.as_deref()
    }

    /// First value of a query parameter, trimmed.
    pub fn parameter(&self, name: &str) -> Option<String> {
        let query = self.request()?.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.trim().to_string())
    }

    /// Every query parameter with all of its values, in order of appearance.
    pub fn parameters(&self) -> HashMap<String, Vec<String>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(query) = self.request().and_then(InboundRequest::query) {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                out.entry(key.into_owned()).or_default().push(value.into_owned());
            }
        }
        out
    }

    /// A parameter captured by the route pattern, e.g. `name` in `/hello/:name`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.context
            .as_ref()?
            .params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First `X-Forwarded-For` entry, else the peer address.
    pub fn client_ip(&self) -> Option<String> {
        let request = self.request()?;
        if let Some(forwarded) = request.header(names::X_FORWARDED_FOR) {
            if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
                return Some(first.to_string());
            }
        }
        request.peer_addr.map(|addr| addr.ip()).map(|ip: IpAddr| ip.to_string())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.request()
            .and_then(|r| r.headers.get(header::USER_AGENT))
            .and_then(|v| v.to_str().ok())
    }

    /// Appends to the response body.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.response.extend_from_slice(bytes);
        self.written = true;
    }

    pub fn write_str(&mut self, text: &str) {
        self.write_bytes(text.as_bytes());
    }

    /// Appends a value mapped according to the response content kind.
    pub fn write_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ContentError> {
        let encoded = self.content_kind.encode_value(value)?;
        self.write_bytes(&encoded);
        Ok(())
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
        self.written = true;
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Sets the response content kind. Defaults to the request's.
    pub fn set_content_kind(&mut self, kind: ContentKind) {
        self.content_kind = kind;
    }

    pub fn set_charset(&mut self, charset: &str) {
        self.charset = Some(charset.to_string());
    }

    pub fn content_kind(&self) -> ContentKind {
        self.content_kind
    }

    /// The response charset: explicit, else the request's, else the kind's default.
    pub fn charset(&self) -> &str {
        self.charset
            .as_deref()
            .or(self.request_charset.as_deref())
            .unwrap_or_else(|| self.content_kind.default_charset())
    }

    pub fn response(&self) -> &[u8] {
        &self.response
    }

    /// Whether the handler produced any part of a response.
    pub fn has_response(&self) -> bool {
        self.written
    }

    /// Replaces the response with the "not found" text for `verb`.
    ///
    /// GET answers 200 and POST answers 404.
    pub fn not_found(&mut self, verb: Verb) {
        let (info, port) = self
            .context
            .as_ref()
            .map(|c| (c.server.default_404_info.clone(), c.server.port))
            .unwrap_or_else(|| {
                let info = ServerInfo::default();
                (info.default_404_info, info.port)
            });
        let uri = self.uri().map(Uri::to_string).unwrap_or_default();
        let text = format!(
            "{info}, Request Url:{uri} \nMethod: {} , Port: {port} , ClassName: {}",
            verb.as_str(),
            self.type_name
        );

        self.response.clear();
        self.write_str(&text);
        self.content_kind = ContentKind::Plain;
        self.status = match verb {
            Verb::Get => StatusCode::OK,
            Verb::Post => StatusCode::NOT_FOUND,
        };
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("instance_id", &self.instance_id)
            .field("type_name", &self.type_name)
            .field("path", &self.path())
            .field("status", &self.status)
            .field("response_len", &self.response.len())
            .finish()
    }
}

/// A user handler and its exchange, recycled as one unit.
pub struct HandlerInstance {
    pub handler: Box<dyn Handler>,
    pub exchange: Exchange,
}

impl HandlerInstance {
    pub fn new(type_name: &'static str, handler: Box<dyn Handler>) -> Self {
        let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        HandlerInstance {
            handler,
            exchange: Exchange::new(id, type_name),
        }
    }

    pub fn id(&self) -> u64 {
        self.exchange.instance_id
    }

    /// Runs the verb method matching the request.
    pub fn invoke(&mut self, verb: Verb) -> HandlerResult {
        match verb {
            Verb::Get => self.handler.get(&mut self.exchange),
            Verb::Post => self.handler.post(&mut self.exchange),
        }
    }
}

impl Poolable for HandlerInstance {
    fn reset(&mut self) {
        self.handler.reset();
        self.exchange.reset();
    }
}

impl fmt::Debug for HandlerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerInstance")
            .field("exchange", &self.exchange)
            .finish_non_exhaustive()
    }
}

/// A routable handler type: factory, outbound policy and instance pool.
pub struct HandlerType {
    name: &'static str,
    policy: TransformPolicy,
    pool: Pool<HandlerInstance>,
    explicit_max: bool,
}

/// Last path segment of a type name, without generic arguments.
fn short_name<H>() -> &'static str {
    let full = type_name::<H>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

impl HandlerType {
    /// A handler type built from `H::default()`.
    pub fn of<H: Handler + Default>() -> Self {
        let name = short_name::<H>();
        HandlerType::from_pool(
            name,
            Pool::new(DEFAULT_MAX_IDLE, move || {
                Ok(HandlerInstance::new(name, Box::new(H::default())))
            }),
        )
    }

    /// A handler type built by a fallible factory.
    ///
    /// A factory error surfaces as [`PoolError::Construction`] on every
    /// acquire: the route is wired to a type that cannot be built.
    pub fn with_factory<F>(name: &'static str, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Handler>, HandlerError> + Send + Sync + 'static,
    {
        HandlerType::from_pool(
            name,
            Pool::new(DEFAULT_MAX_IDLE, move || {
                factory()
                    .map(|handler| HandlerInstance::new(name, handler))
                    .map_err(|e| PoolError::Construction {
                        type_name: name,
                        reason: e.to_string(),
                    })
            }),
        )
    }

    fn from_pool(name: &'static str, pool: Pool<HandlerInstance>) -> Self {
        HandlerType {
            name,
            policy: TransformPolicy::default(),
            pool,
            explicit_max: false,
        }
    }

    pub fn with_policy(mut self, policy: TransformPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bounds the idle instances of this type. Overrides the server-wide bound.
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.pool.set_max_idle(max_idle);
        self.explicit_max = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> &TransformPolicy {
        &self.policy
    }

    pub fn max_idle(&self) -> usize {
        self.pool.max_idle()
    }

    pub fn idle(&self) -> usize {
        self.pool.idle()
    }

    /// Applies the server-wide bound unless this type was given its own.
    pub(crate) fn apply_default_max_idle(&self, max_idle: usize) {
        if !self.explicit_max {
            self.pool.set_max_idle(max_idle);
        }
    }

    /// An idle instance, or a new one when none is free.
    pub fn acquire(&self) -> PoolResult<HandlerInstance> {
        self.pool.obtain()
    }

    /// A new instance, bypassing the pool.
    pub fn create(&self) -> PoolResult<HandlerInstance> {
        self.pool.create()
    }

    /// Resets the instance and pools it. Returns false when it was discarded.
    pub fn release(&self, instance: HandlerInstance) -> bool {
        self.pool.free(instance)
    }
}

impl fmt::Debug for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerType")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::SocketAddr;

    #[derive(Default)]
    struct Counter {
        calls: usize,
    }

    impl Handler for Counter {
        fn get(&mut self, exchange: &mut Exchange) -> HandlerResult {
            self.calls += 1;
            exchange.write_str(&self.calls.to_string());
            Ok(())
        }

        fn reset(&mut self) {
            self.calls = 0;
        }
    }

    fn configured(request: InboundRequest) -> HandlerInstance {
        let mut instance = HandlerType::of::<Counter>().create().unwrap();
        instance.exchange.configure(RequestContext {
            request,
            params: vec![("name".to_string(), "ada".to_string())],
            prefix: "0_1".to_string(),
            server: Arc::new(ServerInfo {
                default_404_info: "HTTP STATUS 404 Not Found".to_string(),
                port: 8080,
            }),
        });
        instance
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name::<Counter>(), "Counter");
        assert_eq!(short_name::<Vec<u8>>(), "Vec");
        assert_eq!(HandlerType::of::<NotFound>().name(), "NotFound");
    }

    /// Tests the request accessors a handler sees once the exchange is configured.
    #[test]
    fn test_exchange_accessors() {
        let peer: SocketAddr = "10.0.0.9:5000".parse().unwrap();
        let mut request = InboundRequest::post("/hello/ada?id=%207%20&tag=a&tag=b", r#"{"n":1}"#)
            .with_header(names::CONTENT_TYPE, "application/json; charset=UTF-8")
            .with_header("user-agent", "curl/8.0");
        request.peer_addr = Some(peer);
        let instance = configured(request);
        let exchange = &instance.exchange;

        assert_eq!(exchange.path(), "/hello/ada");
        assert_eq!(exchange.verb(), Verb::Post);
        assert_eq!(exchange.parameter("id").as_deref(), Some("7"));
        assert_eq!(exchange.parameter("missing"), None);
        assert_eq!(exchange.parameters()["tag"], vec!["a", "b"]);
        assert_eq!(exchange.param("name"), Some("ada"));
        assert_eq!(exchange.client_ip().as_deref(), Some("10.0.0.9"));
        assert_eq!(exchange.user_agent(), Some("curl/8.0"));
        assert_eq!(exchange.request_prefix(), Some("0_1"));
        assert_eq!(exchange.request_content_kind(), ContentKind::Json);
        assert_eq!(exchange.charset(), "UTF-8");

        let value: BTreeMap<String, i32> = exchange.body_value().unwrap();
        assert_eq!(value["n"], 1);
    }

    #[test]
    fn test_forwarded_client_ip() {
        let request = InboundRequest::get("/")
            .with_header(names::X_FORWARDED_FOR, " 203.0.113.5 , 10.0.0.1");
        assert_eq!(
            configured(request).exchange.client_ip().as_deref(),
            Some("203.0.113.5")
        );
    }

    /// Tests the default verb methods and their status codes.
    #[test]
    fn test_default_not_found() {
        let mut instance = configured(InboundRequest::get("/nowhere?x=1"));
        let mut fallback = NotFound;

        fallback.get(&mut instance.exchange).unwrap();
        assert_eq!(instance.exchange.status(), StatusCode::OK);
        assert_eq!(
            instance.exchange.response(),
            "HTTP STATUS 404 Not Found, Request Url:/nowhere?x=1 \nMethod: get , Port: 8080 , ClassName: Counter"
                .as_bytes()
        );

        fallback.post(&mut instance.exchange).unwrap();
        assert_eq!(instance.exchange.status(), StatusCode::NOT_FOUND);
        assert!(String::from_utf8_lossy(instance.exchange.response()).contains("Method: post "));
    }

    /// Tests that reset clears the exchange and the handler's own state.
    #[test]
    fn test_instance_reset() {
        let mut instance = configured(InboundRequest::get("/count"));
        instance.invoke(Verb::Get).unwrap();
        instance.invoke(Verb::Get).unwrap();
        assert_eq!(instance.exchange.response(), b"12");
        instance.exchange.set_status(StatusCode::ACCEPTED);

        let id = instance.id();
        instance.reset();

        assert_eq!(instance.id(), id);
        assert!(!instance.exchange.is_configured());
        assert!(!instance.exchange.has_response());
        assert!(instance.exchange.response().is_empty());
        assert!(instance.exchange.body().is_empty());
        assert_eq!(instance.exchange.status(), StatusCode::OK);
        assert_eq!(instance.exchange.request_prefix(), None);

        instance.invoke(Verb::Get).unwrap();
        assert_eq!(instance.exchange.response(), b"1");
    }

    #[test]
    fn test_write_value_uses_content_kind() {
        let mut instance = configured(InboundRequest::get("/"));
        instance.exchange.set_content_kind(ContentKind::Json);
        instance.exchange.write_value(&[1, 2, 3]).unwrap();
        assert_eq!(instance.exchange.response(), b"[1,2,3]");
    }

    #[test]
    fn test_factory_failure_is_construction_error() {
        let broken = HandlerType::with_factory("Broken", || Err("missing config".into()));
        match broken.acquire() {
            Err(PoolError::Construction { type_name, reason }) => {
                assert_eq!(type_name, "Broken");
                assert_eq!(reason, "missing config");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_explicit_max_idle_wins() {
        let pinned = HandlerType::of::<Counter>().with_max_idle(3);
        pinned.apply_default_max_idle(50);
        assert_eq!(pinned.max_idle(), 3);

        let open = HandlerType::of::<Counter>();
        open.apply_default_max_idle(50);
        assert_eq!(open.max_idle(), 50);
    }
}
