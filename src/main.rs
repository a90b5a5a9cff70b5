//! watchwax - marketplace watch engine.
//!
//! This binary wires the pure services in `watchwax_core` into a running
//! process: the rule scheduler tick, the notification delivery tick, an
//! optional periodic Discogs wantlist/collection sync, and a thin axum
//! surface for the handful of endpoints this process exposes directly
//! (health, the outbound-click affiliate redirect, and a per-user
//! realtime stream). CRUD/auth/CORS/rate-limiting middleware are out of
//! scope here and live in whatever process fronts this one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::Rng;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    middleware as axum_mw,
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use watchwax_core::config::Config;
use watchwax_core::import::{ensure_import_job, execute_import_job};
use watchwax_core::middleware::request_logging;
use watchwax_core::notifications::broker::StreamBroker;
use watchwax_core::notifications::delivery::{run_delivery_tick, StubEmailTransport};
use watchwax_core::rules::scheduler::run_tick;
use watchwax_core::store::import_jobs::ImportScope;
use watchwax_core::store::Store;

/// `watchwax` runs the marketplace watch engine as a long-lived server by
/// default; `watchwax import` drives a single one-shot Discogs
/// wantlist/collection import for one user and exits, for operators who
/// want to kick off an import without waiting for the periodic sync loop.
#[derive(Parser, Debug)]
#[command(name = "watchwax")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler, delivery worker, and HTTP surface (the default).
    Serve,
    /// One-shot Discogs wantlist/collection import for a single user.
    Import {
        /// Email of the user to import for (must already have a connected
        /// Discogs account link).
        #[arg(short, long)]
        email: String,

        /// Which list(s) to import.
        #[arg(short, long, value_enum, default_value = "both")]
        scope: ImportScopeArg,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ImportScopeArg {
    Wantlist,
    Collection,
    Both,
}

impl From<ImportScopeArg> for ImportScope {
    fn from(v: ImportScopeArg) -> Self {
        match v {
            ImportScopeArg::Wantlist => ImportScope::Wantlist,
            ImportScopeArg::Collection => ImportScope::Collection,
            ImportScopeArg::Both => ImportScope::Both,
        }
    }
}

#[derive(Clone)]
struct AppState {
    store: Arc<Store>,
    config: Arc<Config>,
    broker: Arc<StreamBroker>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(&config.log_level);

    let store = Store::new(&config.database_path)?;

    match cli.command {
        Some(Commands::Import { email, scope }) => {
            run_one_shot_import(store, config, &email, scope.into()).await
        }
        Some(Commands::Serve) | None => run_server(store, config).await,
    }
}

/// `watchwax import --email <e> --scope <s>`: admit (or reuse) a single-flight
/// import job for the user with that email and run it to completion, then
/// exit. Mirrors what the periodic Discogs sync loop does per user, but for
/// one user, synchronously, from the command line.
async fn run_one_shot_import(
    store: Store,
    config: Config,
    email: &str,
    scope: ImportScope,
) -> anyhow::Result<()> {
    let user = store
        .find_user_by_email(email)?
        .ok_or_else(|| anyhow::anyhow!("no user with email {email}"))?;
    if !user.is_active {
        anyhow::bail!("user {email} is deactivated");
    }

    let (job, created) = ensure_import_job(&store, &config, user.id, scope)?;
    if !created {
        info!(job_id = %job.id, "reusing an already in-flight or recently-completed import job");
    }
    execute_import_job(&store, &config, job.id).await?;

    let job = store
        .get_import_job(job.id)?
        .ok_or_else(|| anyhow::anyhow!("import job disappeared"))?;
    info!(
        job_id = %job.id,
        status = ?job.status,
        processed = job.processed_count,
        created = job.created_count,
        updated = job.updated_count,
        errors = job.error_count,
        "import job finished"
    );
    Ok(())
}

async fn run_server(store: Store, config: Config) -> anyhow::Result<()> {
    info!("starting watchwax marketplace watch engine");

    let store = Arc::new(store);
    let config = Arc::new(config);
    let broker = Arc::new(StreamBroker::new());

    spawn_scheduler_loop(store.clone(), config.clone());
    spawn_delivery_loop(store.clone(), config.clone(), broker.clone());
    if config.discogs_sync_enabled {
        spawn_discogs_sync_loop(store.clone(), config.clone());
    }

    let state = AppState { store, config: config.clone(), broker };

    let app = Router::new()
        .route("/health", get(health))
        .route("/outbound/ebay/:listing_id", get(outbound_ebay_redirect))
        .route("/stream/:user_id", get(stream_user_events))
        .layer(axum_mw::from_fn(request_logging))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "listening");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Periodic rule-scheduler tick. Ticks forever on
/// `config.scheduler_tick_interval_seconds`; a single rule failure never
/// aborts the loop, and the tick itself never panics the task since
/// `run_tick` surfaces errors per-rule, not per-tick.
fn spawn_scheduler_loop(store: Arc<Store>, config: Arc<Config>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.scheduler_tick_interval());
        loop {
            ticker.tick().await;
            match run_tick(&store, &config).await {
                Ok(outcome) => {
                    if outcome.claimed > 0 {
                        info!(
                            claimed = outcome.claimed,
                            processed = outcome.processed,
                            failed = outcome.failed,
                            "scheduler tick complete"
                        );
                    }
                }
                Err(e) => error!(error = %e, "scheduler tick failed"),
            }
        }
    });
}

/// Periodic notification-delivery tick. Runs on the same
/// cadence family as the scheduler but independently, since delivery
/// backlog and rule due-ness are unrelated clocks.
fn spawn_delivery_loop(store: Arc<Store>, config: Arc<Config>, broker: Arc<StreamBroker>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        let email = StubEmailTransport;
        loop {
            ticker.tick().await;
            match run_delivery_tick(&store, &config, &broker, &email).await {
                Ok(outcome) => {
                    if outcome.claimed > 0 {
                        info!(
                            claimed = outcome.claimed,
                            sent = outcome.sent,
                            retried = outcome.retried,
                            failed = outcome.failed,
                            "delivery tick complete"
                        );
                    }
                }
                Err(e) => error!(error = %e, "delivery tick failed"),
            }
        }
    });
}

/// Periodic Discogs wantlist/collection re-sync for every user with a
/// connected account, gated behind `DISCOGS_SYNC_ENABLED` since most
/// deployments only import on explicit user request via the API layer.
/// `ensure_import_job` makes repeat ticks within `discogs_import_cooldown_seconds`
/// of a prior run a no-op rather than a poll storm.
fn spawn_discogs_sync_loop(store: Arc<Store>, config: Arc<Config>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            config.discogs_sync_interval_seconds.max(1) as u64,
        ));
        loop {
            ticker.tick().await;
            let users = match store.list_active_users() {
                Ok(users) => users,
                Err(e) => {
                    error!(error = %e, "discogs sync: failed to list active users");
                    continue;
                }
            };

            for user in users {
                let Ok(Some(_link)) = store.find_link(user.id, "discogs") else {
                    continue;
                };
                let jitter_secs = if config.discogs_sync_jitter_seconds > 0 {
                    rand::thread_rng().gen_range(0..config.discogs_sync_jitter_seconds as u64)
                } else {
                    0
                };
                tokio::time::sleep(Duration::from_secs(jitter_secs)).await;

                match ensure_import_job(&store, &config, user.id, ImportScope::Both) {
                    Ok((job, true)) => {
                        if let Err(e) = execute_import_job(&store, &config, job.id).await {
                            warn!(user_id = %user.id, error = %e, "discogs sync import run failed");
                        }
                    }
                    Ok((_, false)) => {}
                    Err(e) => warn!(user_id = %user.id, error = %e, "discogs sync admission failed"),
                }
            }
        }
    });
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// `GET /outbound/ebay/{listing_id}` — 307 redirect to the listing's URL
/// with eBay Partner Network affiliate params appended.
/// Recording the click is best-effort: a storage failure here must never
/// block the redirect itself.
async fn outbound_ebay_redirect(
    State(state): State<AppState>,
    Path(listing_id): Path<Uuid>,
) -> Response {
    let listing = match state.store.get_listing(listing_id) {
        Ok(Some(listing)) => listing,
        Ok(None) => return (StatusCode::NOT_FOUND, "listing not found").into_response(),
        Err(e) => {
            error!(error = %e, "failed to load listing for outbound redirect");
            return (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response();
        }
    };

    if let Err(e) = state.store.insert_outbound_click(listing_id, None) {
        warn!(listing_id = %listing_id, error = %e, "failed to record outbound click");
    }

    let target = build_ebay_affiliate_url(&listing.url, &state.config);
    Redirect::temporary(&target).into_response()
}

fn build_ebay_affiliate_url(original_url: &str, config: &Config) -> String {
    let mut params = vec![
        ("mkevt".to_string(), "1".to_string()),
        ("mkcid".to_string(), "1".to_string()),
        ("mkrid".to_string(), "711-53200-19255-0".to_string()),
        ("toolid".to_string(), "10001".to_string()),
    ];
    if let Some(campid) = &config.ebay_campaign_id {
        params.push(("campid".to_string(), campid.clone()));
    }
    if let Some(customid) = &config.ebay_custom_id {
        params.push(("customid".to_string(), customid.clone()));
    }

    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencode(v)))
        .collect::<Vec<_>>()
        .join("&");

    if original_url.contains('?') {
        format!("{original_url}&{query}")
    } else {
        format!("{original_url}?{query}")
    }
}

fn urlencode(value: &str) -> String {
    value
        .chars()
        .flat_map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
                vec![c]
            } else {
                format!("%{:02X}", c as u32).chars().collect()
            }
        })
        .collect()
}

/// `GET /stream/{user_id}` — subscribes the connecting websocket to the
/// in-process stream broker for that user (when the
/// client disconnects, the broker subscription is removed).
async fn stream_user_events(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_stream_socket(socket, state, user_id))
}

async fn handle_stream_socket(mut socket: WebSocket, state: AppState, user_id: Uuid) {
    let mut subscription = state.broker.subscribe(user_id);
    loop {
        tokio::select! {
            payload = subscription.receiver.recv() => {
                match payload {
                    Some(payload) => {
                        let text = payload.to_string();
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    state.broker.unsubscribe(user_id, subscription.id);
}
