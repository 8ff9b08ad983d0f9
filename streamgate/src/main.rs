//! Process entry point: load configuration, wire the component graph, and
//! run the HTTP accept loop.

mod balancer;
mod config;
mod handlers;
mod metastore;
mod middlewares;
mod session_pool;
mod streamer;
mod upstream;

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use streamgate_cache::TtlLruCache;
use streamgate_core::{box_incoming, GatewayRequest, HandlerFn, LogConfig, MiddlewareChain};

use crate::balancer::LoadBalancer;
use crate::config::Config;
use crate::handlers::AppState;
use crate::metastore::InMemoryMetaStore;
use crate::middlewares::{ErrorMapMiddleware, PeerAddr, PerformanceMiddleware, RateLimitMiddleware, TimeoutMiddleware};
use crate::session_pool::SessionPool;
use crate::streamer::Streamer;
use crate::upstream::{SimulatedUpstream, UpstreamRpc};

/// Home DCs cycled across simulated clients. A real deployment's clients
/// each authenticate independently and report their own home DC; this
/// fixed small set stands in for that since the upstream client library
/// itself is outside this system's scope.
const DC_POOL: [u32; 4] = [1, 2, 4, 5];

#[tokio::main]
async fn main() {
    let config = Arc::new(Config::from_env().unwrap_or_else(|err| {
        eprintln!("{err}");
        std::process::exit(1);
    }));

    let log_config = LogConfig::from_env();
    let _log_guard = log_config.init();

    tracing::info!(mode = ?config.mode, port = config.server.port, "starting streamgate");

    let worker_count = if config.telegram.multi_client {
        config.telegram.workers.clamp(1, DC_POOL.len() as u32 * 2)
    } else {
        1
    };

    let mut clients: HashMap<u32, Arc<dyn UpstreamRpc + Send + Sync>> = HashMap::new();
    for i in 0..worker_count {
        let client_id = i + 1;
        let home_dc = DC_POOL[(i as usize) % DC_POOL.len()];
        clients.insert(client_id, Arc::new(SimulatedUpstream::new(client_id, home_dc)));
    }

    let balancer = Arc::new(LoadBalancer::new(clients.keys().copied()));
    let session_pool = Arc::new(SessionPool::new());
    session_pool.spawn_maintenance();

    let metastore = Arc::new(InMemoryMetaStore::new());
    let metadata_cache = Arc::new(TtlLruCache::new(
        config.metadata_cache_capacity(),
        config.server.cache_ttl,
    ));
    metadata_cache.spawn_sweeper();

    let streamer = Arc::new(Streamer::new(
        metastore,
        Arc::clone(&session_pool),
        Arc::clone(&balancer),
        metadata_cache,
        config.telegram.chunk_size,
    ));
    streamer.spawn_cooldown_sweeper();

    let state = Arc::new(AppState::new(
        Arc::clone(&config),
        clients,
        balancer,
        session_pool,
        streamer,
    ));

    let chain = Arc::new(
        MiddlewareChain::new()
            .with(ErrorMapMiddleware)
            .with(RateLimitMiddleware::new(
                config.server.rate_limit,
                config.server.burst_limit,
                config.server.rate_limit_whitelist.clone(),
            ))
            .with(TimeoutMiddleware::new(config.server.request_timeout))
            .with(PerformanceMiddleware),
    );

    if let Err(err) = run_server(config, state, chain).await {
        tracing::error!(error = %err, "server exited with an error");
        std::process::exit(1);
    }
}

async fn run_server(
    config: Arc<Config>,
    state: Arc<AppState>,
    chain: Arc<MiddlewareChain>,
) -> std::io::Result<()> {
    let addr = SocketAddr::new(config.server.bind_address, config.server.port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);
        let chain = Arc::clone(&chain);

        tokio::spawn(async move {
            let service = service_fn(move |req: hyper::Request<Incoming>| {
                let state = Arc::clone(&state);
                let chain = Arc::clone(&chain);
                async move {
                    let gateway_req = convert_request(req, peer_addr);
                    let handler = make_handler(Arc::clone(&state));

                    let response = match chain.apply(gateway_req, handler).await {
                        Ok(resp) => resp,
                        Err(cancelled) => {
                            // The only variant ErrorMapMiddleware lets through:
                            // client disconnected or the request was cancelled.
                            // Nothing will read this, but the service still owes
                            // hyper a response value.
                            hyper::Response::builder()
                                .status(cancelled.status_code())
                                .body(streamgate_core::empty_body())
                                .expect("well-formed cancellation response")
                        }
                    };
                    Ok::<_, Infallible>(response)
                }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %err, "connection error");
            }
        });
    }
}

fn convert_request(req: hyper::Request<Incoming>, peer_addr: SocketAddr) -> GatewayRequest {
    let (mut parts, body) = req.into_parts();
    parts.extensions.insert(PeerAddr(peer_addr));
    hyper::Request::from_parts(parts, box_incoming(body))
}

fn make_handler(state: Arc<AppState>) -> HandlerFn {
    Arc::new(move |req: GatewayRequest| {
        let state = Arc::clone(&state);
        Box::pin(async move { handlers::route(state, req).await })
    })
}
