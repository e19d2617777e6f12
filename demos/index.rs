//! A small server showing pooled handlers and negotiated transforms.
//!
//! Routes:
//! - GET  /index?name=..   greets the caller
//! - POST /echo            returns the body, transformed as the client asked
//! - POST /sealed          always answers gzip + AES
//! - GET  /hello/:name     path parameters

use std::collections::BTreeMap;

use sheath::{
    Compression, ContentKind, Exchange, Handler, HandlerResult, HandlerType, Routes, Server,
    ServerConfig, TransformPolicy,
};

#[derive(Default)]
struct Index;

impl Handler for Index {
    fn get(&mut self, exchange: &mut Exchange) -> HandlerResult {
        let name = exchange.parameter("name").unwrap_or_else(|| "stranger".into());
        let ip = exchange.client_ip().unwrap_or_default();
        let greeting = format!(
            "hello {name} from {ip} (request {})",
            exchange.request_prefix().unwrap_or_default()
        );
        exchange.write_str(&greeting);
        Ok(())
    }
}

#[derive(Default)]
struct Echo;

impl Handler for Echo {
    fn post(&mut self, exchange: &mut Exchange) -> HandlerResult {
        let body = exchange.body().clone();
        exchange.write_bytes(&body);
        Ok(())
    }
}

#[derive(Default)]
struct Sealed;

impl Handler for Sealed {
    fn post(&mut self, exchange: &mut Exchange) -> HandlerResult {
        let mut reply = BTreeMap::new();
        reply.insert("errCode", 0);
        reply.insert("received", exchange.body().len());
        exchange.set_content_kind(ContentKind::Json);
        exchange.write_value(&reply)?;
        Ok(())
    }
}

#[derive(Default)]
struct Hello;

impl Handler for Hello {
    fn get(&mut self, exchange: &mut Exchange) -> HandlerResult {
        let name = exchange.param("name").unwrap_or("world").to_owned();
        exchange.write_str(&format!("Hello, {name}!"));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::new()?;
    log::info!("Starting on http://{}", config.address());

    let sealed = TransformPolicy::default()
        .force_compression(Compression::Gzip)
        .force_encryption(None, Some("a"))
        .follow_client(false, false);

    let routes = Routes::new()
        .route::<Index>("/index")?
        .route::<Echo>("/echo")?
        .route::<Hello>("/hello/:name")?
        .insert("/sealed", HandlerType::of::<Sealed>().with_policy(sealed).with_max_idle(16))?;

    Server::new(config).serve_routes(routes).await?;
    Ok(())
}
