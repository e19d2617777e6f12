use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::Body;
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::error::ServerError;
use crate::executor::{Executor, WorkerId};
use crate::http::{InboundRequest, OutboundResponse};
use crate::routes::Routes;

/// Where a request came from and which worker is serving it.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub peer_addr: Option<SocketAddr>,
    pub worker: WorkerId,
}

/// Turns a complete request into a complete response.
///
/// Called on a blocking worker thread, never on the async runtime.
pub trait Service: Send + Sync + 'static {
    fn call(&self, request: InboundRequest, info: ConnectionInfo) -> OutboundResponse;
}

impl<F> Service for F
where
    F: Fn(InboundRequest, ConnectionInfo) -> OutboundResponse + Send + Sync + 'static,
{
    fn call(&self, request: InboundRequest, info: ConnectionInfo) -> OutboundResponse {
        self(request, info)
    }
}

impl Service for Dispatcher {
    fn call(&self, request: InboundRequest, info: ConnectionInfo) -> OutboundResponse {
        self.dispatch(request, info.worker)
    }
}

/// The HTTP server.
///
/// Connections are driven by hyper on the tokio runtime. Each request body is
/// read in full, then the request is handed to the [`Service`] on the worker
/// pool, so handlers may block without stalling other connections.
pub struct Server {
    config: ServerConfig,
    listener: Option<std::net::TcpListener>,
}

impl Server {
    /// A server that binds to `host:port` of `config`.
    pub fn new(config: ServerConfig) -> Self {
        Server {
            config,
            listener: None,
        }
    }

    /// A server with default settings bound to `addr`, e.g. `"127.0.0.1:3000"`.
    ///
    /// Falls back to the configured host and port when `addr` does not parse.
    pub fn bind(addr: &str) -> Self {
        let mut config = ServerConfig::default();
        if let Ok(parsed) = addr.parse::<SocketAddr>() {
            config.host = parsed.ip().to_string();
            config.port = parsed.port();
        } else {
            log::warn!("Invalid bind address {:?}, using {}", addr, config.address());
        }
        Server::new(config)
    }

    /// A server accepting on an already bound listener.
    pub fn from_listener(listener: std::net::TcpListener, config: ServerConfig) -> Self {
        Server {
            config,
            listener: Some(listener),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Builds the key material from the configuration and serves `routes`.
    ///
    /// # Errors
    /// Fails if the key material cannot be built, or as [`Server::serve`] does.
    pub async fn serve_routes(self, routes: Routes) -> Result<(), ServerError> {
        let keys = self.config.key_ring()?;
        let dispatcher = Dispatcher::new(&self.config, routes, keys);
        self.serve(dispatcher).await
    }

    /// Accepts connections until the listener fails to bind.
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound. Per-connection errors
    /// are logged and do not stop the server.
    pub async fn serve<S: Service>(self, service: S) -> Result<(), ServerError> {
        let listener = match self.listener {
            Some(listener) => {
                listener.set_nonblocking(true)?;
                TcpListener::from_std(listener)?
            }
            None => TcpListener::bind(self.config.address()).await?,
        };
        log::info!("Listening on http://{}", listener.local_addr()?);

        let executor = Executor::new(
            Some(self.config.max_workers),
            Some(self.config.worker_keep_alive()),
        );
        let http = Arc::new(connection_settings(&self.config));
        let service = Arc::new(service);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let http = http.clone();
            let service = service.clone();
            let executor = executor.clone();
            tokio::spawn(async move {
                let handler = service_fn(move |request| {
                    respond(request, peer, service.clone(), executor.clone())
                });
                if let Err(e) = http.serve_connection(stream, handler).await {
                    log::debug!("Connection from {} ended: {}", peer, e);
                }
            });
        }
    }
}

/// Reads the whole request, then serves it on a worker thread.
async fn respond<S: Service>(
    request: hyper::Request<Body>,
    peer: SocketAddr,
    service: Arc<S>,
    executor: Executor,
) -> Result<hyper::Response<Body>, Infallible> {
    let (parts, body) = request.into_parts();
    let body = match hyper::body::to_bytes(body).await {
        Ok(body) => body,
        Err(e) => {
            log::warn!("Failed to read request body from {}: {}", peer, e);
            return Ok(OutboundResponse::internal_error().into_hyper());
        }
    };
    let request = InboundRequest::from_parts(parts, body, Some(peer));

    let response = executor
        .run(move |worker| {
            service.call(
                request,
                ConnectionInfo {
                    peer_addr: Some(peer),
                    worker,
                },
            )
        })
        .await;

    Ok(match response {
        Ok(response) => response.into_hyper(),
        Err(e) => {
            log::error!("Request from {} was not served: {}", peer, e);
            OutboundResponse::internal_error().into_hyper()
        }
    })
}

/// hyper connection settings from the configuration.
fn connection_settings(config: &ServerConfig) -> Http {
    let mut http = Http::new();
    http.http1_keep_alive(config.keep_alive)
        .http1_half_close(config.http1_half_close)
        .max_buf_size(config.http1_max_buf_size.max(8192))
        .http1_writev(config.http1_writev)
        .http1_title_case_headers(config.http1_title_case_headers)
        .http1_preserve_header_case(config.http1_preserve_header_case)
        .http1_only(config.http1_only)
        .pipeline_flush(config.http1_pipeline_flush);

    #[cfg(feature = "http2")]
    http.http2_only(config.http2_only)
        .http2_initial_stream_window_size(config.http2_initial_stream_window_size)
        .http2_initial_connection_window_size(config.http2_initial_connection_window_size)
        .http2_adaptive_window(config.http2_adaptive_window)
        .http2_max_frame_size(config.http2_max_frame_size)
        .http2_max_concurrent_streams(config.http2_max_concurrent_streams)
        .http2_max_send_buf_size(config.http2_max_send_buf_size);

    http
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::test_ring;
    use crate::handler::{Exchange, Handler, HandlerResult};
    use crate::http::names;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[derive(Default)]
    struct Hello;

    impl Handler for Hello {
        fn get(&mut self, exchange: &mut Exchange) -> HandlerResult {
            let name = exchange.param("name").unwrap_or("world").to_owned();
            exchange.write_str(&format!("hello {name}"));
            Ok(())
        }

        fn post(&mut self, exchange: &mut Exchange) -> HandlerResult {
            let body = exchange.body().clone();
            exchange.write_bytes(&body);
            Ok(())
        }
    }

    async fn exchange(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Tests full requests over TCP: routing with path parameters, the
    /// fallback handler, and negotiation headers going out title-cased.
    #[test]
    fn test_end_to_end() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let config = ServerConfig {
                use_object_pool: true,
                max_workers: 4,
                ..ServerConfig::default()
            };
            let routes = Routes::new().route::<Hello>("/hello/:name").unwrap();
            let dispatcher = Dispatcher::new(&config, routes, test_ring());
            tokio::spawn(Server::from_listener(listener, config).serve(dispatcher));

            let reply = exchange(
                addr,
                "GET /hello/ada HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            )
            .await;
            assert!(reply.starts_with("HTTP/1.1 200 OK"), "{reply}");
            assert!(reply.contains("Content-Type: text/plain; charset=UTF-8"), "{reply}");
            assert!(reply.ends_with("hello ada"), "{reply}");

            let reply = exchange(
                addr,
                "POST /nowhere HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            )
            .await;
            assert!(reply.starts_with("HTTP/1.1 404 Not Found"), "{reply}");
            assert!(reply.contains("ClassName: NotFound"), "{reply}");

            let body = STANDARD.encode("ping");
            let raw = format!(
                "POST /hello/x HTTP/1.1\r\nHost: localhost\r\n{}: b\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                names::ORIGINAL_ENCRYPT,
                body.len(),
                body
            );
            let reply = exchange(addr, &raw).await;
            assert!(reply.contains("Original-Encrypt: b"), "{reply}");
            assert!(reply.ends_with(&body), "{reply}");
        });
    }

    /// Tests that a plain closure can serve as the service.
    #[test]
    fn test_closure_service() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let service = |request: InboundRequest, info: ConnectionInfo| {
                let peer = info.peer_addr.map(|a| a.ip().to_string()).unwrap_or_default();
                OutboundResponse::new(
                    hyper::StatusCode::OK,
                    format!("{} from {}", request.path(), peer),
                )
            };
            tokio::spawn(Server::from_listener(listener, ServerConfig::default()).serve(service));

            let reply = exchange(
                addr,
                "GET /ping HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            )
            .await;
            assert!(reply.ends_with("/ping from 127.0.0.1"), "{reply}");
        });
    }

    #[test]
    fn test_bind_address() {
        let server = Server::bind("0.0.0.0:8088");
        assert_eq!(server.config().address(), "0.0.0.0:8088");

        let server = Server::bind("not an address");
        assert_eq!(server.config().address(), "127.0.0.1:3000");
    }

    /// Tests that hyper accepts the configured buffer size, including ones below its minimum.
    #[test]
    fn test_connection_settings() {
        let mut config = ServerConfig::default();
        for size in [0, 1024, 8192, 1 << 20] {
            config.http1_max_buf_size = size;
            let _http = connection_settings(&config);
        }
    }
}
