use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use ripplekv::{
    config::{parse_peer_list, ENV_DATA_DIR, ENV_NODE_ID, ENV_PEERS},
    http::{self as peer_http, HttpTransport, KeysQuery, KeysResponse},
    node::NodeStatus,
    types::NodeId,
    Config, Error, Node,
};
use tokio::{
    task::spawn_blocking,
    time::{interval, Duration},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

type KvNode = Node<HttpTransport>;

#[derive(Parser, Debug)]
#[command(name = "kvnode")]
#[command(about = "Run one ripplekv replica over HTTP", long_about = None)]
struct Cli {
    /// Node ID, unique in the group and below 1000
    #[arg(short, long, env = ENV_NODE_ID)]
    id: NodeId,

    /// Data directory for the snapshot and transaction log
    #[arg(short, long, env = ENV_DATA_DIR, default_value = "./ripplekv_data")]
    data_dir: PathBuf,

    /// HTTP listen address (e.g., 127.0.0.1:7001)
    #[arg(short, long)]
    addr: String,

    /// Peer addresses (e.g., "127.0.0.1:7002,127.0.0.1:7003")
    #[arg(short, long, env = ENV_PEERS, default_value = "")]
    peers: String,

    /// Seconds between snapshot writes
    #[arg(long, default_value_t = 10)]
    persist_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::builder()
        .node_id(cli.id)
        .data_dir(cli.data_dir)
        .peers(parse_peer_list(&cli.peers))
        .build();

    info!("Starting kvnode {} on {}", cli.id, cli.addr);
    let node = Arc::new(Node::open(config, Arc::new(HttpTransport::new()))?);

    if let Err(e) = node.catch_up().await {
        warn!("Catch-up failed, starting from local state: {e:#}");
    }

    let app = peer_http::router(node.clone()).merge(client_routes(node.clone()));

    let node_for_persist = node.clone();
    let persist_every = Duration::from_secs(cli.persist_interval.max(1));
    tokio::spawn(async move {
        let mut ticker = interval(persist_every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let node = node_for_persist.clone();
            match spawn_blocking(move || node.persist()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("Periodic persist failed: {err:#}"),
                Err(join_err) => error!("Periodic persist task panicked: {join_err}"),
            }
        }
    });

    let socket_addr: SocketAddr = cli.addr.parse()?;
    info!("HTTP server listening on {}", socket_addr);
    axum::serve(tokio::net::TcpListener::bind(socket_addr).await?, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {e}");
            }
        })
        .await?;

    node.shutdown().await?;
    Ok(())
}

fn client_routes(node: Arc<KvNode>) -> Router {
    Router::new()
        .route("/kv", get(handle_list))
        .route(
            "/kv/{key}",
            get(handle_get).put(handle_set).delete(handle_delete),
        )
        .route("/debug/status", get(handle_status))
        .with_state(node)
}

async fn handle_get(
    State(node): State<Arc<KvNode>>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let item = node.get(&key).ok_or(Error::NotFound(key))?;
    let mut headers = HeaderMap::new();
    if let Ok(version) = item.version.to_string().parse() {
        headers.insert("x-version", version);
    }
    Ok((headers, item.value))
}

async fn handle_set(
    State(node): State<Arc<KvNode>>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<String, Error> {
    let version = node.set(&key, body.to_vec())?;
    Ok(version.to_string())
}

async fn handle_delete(
    State(node): State<Arc<KvNode>>,
    Path(key): Path<String>,
) -> Result<String, Error> {
    let version = node.delete(&key)?;
    Ok(version.to_string())
}

async fn handle_list(
    State(node): State<Arc<KvNode>>,
    Query(query): Query<KeysQuery>,
) -> Result<Json<KeysResponse>, Error> {
    let keys = node.keys(&query.pattern)?;
    Ok(Json(KeysResponse { keys }))
}

async fn handle_status(State(node): State<Arc<KvNode>>) -> Json<NodeStatus> {
    Json(node.status())
}
