//! Runs one request through its handler.
//!
//! Per request: route, acquire an instance, configure it, undo the client's
//! transforms, invoke the verb method, apply the outbound transforms, then
//! reset and release the instance. The release happens on every path out,
//! including handler errors and panics.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use hyper::header::{self, HeaderValue};

use crate::config::ServerConfig;
use crate::crypto::KeyRing;
use crate::executor::WorkerId;
use crate::handler::{HandlerInstance, HandlerType, NotFound, RequestContext, ServerInfo};
use crate::http::{Bytes, InboundRequest, OutboundResponse, Verb};
use crate::routes::Routes;
use crate::stats::{RequestIds, RouteStats};
use crate::transform::{ContentEnvelope, TransformEngine};

pub struct Dispatcher {
    routes: Routes,
    fallback: Arc<HandlerType>,
    engine: TransformEngine,
    server: Arc<ServerInfo>,
    use_object_pool: bool,
    pool_max_idle: usize,
    keep_alive: bool,
    stats: RouteStats,
    ids: RequestIds,
}

impl Dispatcher {
    /// Builds a dispatcher over a finished route table.
    ///
    /// Handler types without their own idle bound get `pool_max_idle`.
    pub fn new(config: &ServerConfig, routes: Routes, keys: KeyRing) -> Self {
        for (_, handler_type) in routes.entries() {
            handler_type.apply_default_max_idle(config.pool_max_idle);
        }
        let fallback = HandlerType::of::<NotFound>();
        fallback.apply_default_max_idle(config.pool_max_idle);

        Dispatcher {
            routes,
            fallback: Arc::new(fallback),
            engine: TransformEngine::new(keys),
            server: config.server_info(),
            use_object_pool: config.use_object_pool,
            pool_max_idle: config.pool_max_idle,
            keep_alive: config.keep_alive,
            stats: RouteStats::new(),
            ids: RequestIds::new(),
        }
    }

    /// Replaces the handler type that serves unmapped paths.
    pub fn with_fallback(mut self, fallback: HandlerType) -> Self {
        fallback.apply_default_max_idle(self.pool_max_idle);
        self.fallback = Arc::new(fallback);
        self
    }

    pub fn engine(&self) -> &TransformEngine {
        &self.engine
    }

    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    /// Hits per request path.
    pub fn stats(&self) -> &RouteStats {
        &self.stats
    }

    pub fn fallback(&self) -> &Arc<HandlerType> {
        &self.fallback
    }

    /// Serves one request on the calling thread.
    ///
    /// Never fails: routing misses go to the fallback handler, transform
    /// failures pass data through untouched, and handler failures become a
    /// 500 unless the handler already produced a response.
    pub fn dispatch(&self, request: InboundRequest, worker: WorkerId) -> OutboundResponse {
        let path = request.path().to_owned();

        // Counted per route pattern, and unmapped paths under the fallback's
        // name, so the map holds one entry per route.
        let (handler_type, params) = match self.routes.resolve(&path) {
            Ok(resolved) => {
                self.stats.add(resolved.pattern, 1);
                (resolved.handler_type, resolved.params)
            }
            Err(e) => {
                log::debug!("{}, serving with {}", e, self.fallback.name());
                self.stats.add(self.fallback.name(), 1);
                (self.fallback.clone(), Vec::new())
            }
        };

        let acquired = if self.use_object_pool {
            handler_type.acquire()
        } else {
            handler_type.create()
        };
        let mut instance = match acquired {
            Ok(instance) => instance,
            Err(e) => {
                log::error!("{} cannot be served: {}", path, e);
                return OutboundResponse::internal_error();
            }
        };
        log::debug!(
            "{} using {} instance {} ({} idle)",
            path,
            handler_type.name(),
            instance.id(),
            handler_type.idle()
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.process(&handler_type, &mut instance, request, params, worker)
        }));

        if self.use_object_pool {
            handler_type.release(instance);
        }

        match outcome {
            Ok(response) => response,
            Err(cause) => {
                log::error!("{} dispatch aborted: {}", path, panic_message(&*cause));
                OutboundResponse::internal_error()
            }
        }
    }

    fn process(
        &self,
        handler_type: &HandlerType,
        instance: &mut HandlerInstance,
        request: InboundRequest,
        params: Vec<(String, String)>,
        worker: WorkerId,
    ) -> OutboundResponse {
        let path = request.path().to_owned();
        let verb = Verb::from(&request.method);
        let method = request.method.clone();
        let keep_alive = self.keep_alive && request.wants_keep_alive();

        let client = ContentEnvelope::from_headers(&request.headers).unwrap_or_else(|e| {
            log::warn!("{} negotiation headers ignored: {}", path, e);
            ContentEnvelope::default()
        });

        instance.exchange.configure(RequestContext {
            request,
            params,
            prefix: self.ids.next(worker),
            server: self.server.clone(),
        });
        log::info!(
            "{} {} {}",
            instance.exchange.client_ip().unwrap_or_default(),
            method,
            path
        );

        if verb == Verb::Post && client.is_transformed() {
            let received = client.clone().with_payload(instance.exchange.body().clone());
            match self.engine.decode(&received) {
                Ok(body) => instance.exchange.set_body(body),
                Err(degraded) => log::warn!("{} request body left as sent: {}", path, degraded),
            }
        }
        instance.exchange.set_envelope(client.clone());

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| instance.invoke(verb)));
        let failed = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                log::error!("{} {} failed: {}", path, verb_label(verb), e);
                true
            }
            Err(cause) => {
                log::error!("{} {} panicked: {}", path, verb_label(verb), panic_message(&*cause));
                true
            }
        };
        log::info!(
            "{} {} took {}ms",
            path,
            verb_label(verb),
            started.elapsed().as_millis()
        );

        if failed && !instance.exchange.has_response() {
            return OutboundResponse::internal_error();
        }

        let exchange = &instance.exchange;
        let body = Bytes::copy_from_slice(exchange.response());
        let policy = handler_type.policy();
        let (chain, compression) = policy.negotiate(verb, &client);

        let envelope = if chain.is_empty() && compression.is_none() {
            ContentEnvelope::plain(body)
        } else {
            self.engine
                .encode(body, &chain, compression, policy.min_compress_size)
                .unwrap_or_else(|degraded| {
                    log::warn!("{} response sent untransformed: {}", path, degraded);
                    ContentEnvelope::plain(degraded.payload)
                })
        };

        let mut response = OutboundResponse::new(exchange.status(), Bytes::new());
        envelope.write_headers(&mut response.headers);
        if let Ok(value) =
            HeaderValue::from_str(&exchange.content_kind().header_value(exchange.charset()))
        {
            response.headers.insert(header::CONTENT_TYPE, value);
        }
        response.body = envelope.payload;
        if !keep_alive {
            response.close();
        }
        response
    }
}

fn verb_label(verb: Verb) -> &'static str {
    match verb {
        Verb::Get => "GET",
        Verb::Post => "POST",
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> &str {
    cause
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| cause.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
