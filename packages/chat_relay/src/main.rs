use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod auth;
mod cli;
mod config;
mod db;
mod error;
mod handlers;
mod metrics;
mod models;
mod multiplexer;
mod repository;
mod source;
mod store;
#[cfg(test)]
mod test_helpers;

use crate::auth::AuthState;
use crate::config::{AuthConfig, ChatConfig, FileConfig, RelayConfig, SourceConfig, load_config};
use crate::db::Database;
use crate::metrics::ServerMetrics;
use crate::multiplexer::Multiplexer;
use crate::repository::ChatRepository;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Resumable streaming relay for chat replies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.chat-relay)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground
    Server(ServerArgs),

    /// Create a password account
    AddUser(AddUserArgs),

    /// Chat with a running relay from the terminal
    Chat(ChatArgs),

    /// Attach to a reply that is still streaming
    Resume(ResumeArgs),

    /// Stop a reply that is still streaming
    Cancel(SessionArgs),

    /// Print the effective configuration (defaults, config.toml and RELAY_* env vars) as TOML
    Config,
}

#[derive(Parser)]
struct ServerArgs {
    /// Port for the web server (overrides config.toml)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config.toml)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct AddUserArgs {
    username: String,

    /// Name shown to other users (defaults to the username)
    #[arg(long)]
    display_name: Option<String>,

    /// Password for the account (prompted for when omitted)
    #[arg(long)]
    password: Option<String>,
}

#[derive(Args)]
struct ConnectArgs {
    /// Relay base URL
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    url: String,

    /// Login token (when auth is enabled)
    #[arg(long, conflicts_with = "user")]
    token: Option<String>,

    /// Log in as this user; the password is read from stdin
    #[arg(short, long)]
    user: Option<String>,
}

impl From<ConnectArgs> for cli::Connection {
    fn from(args: ConnectArgs) -> Self {
        cli::Connection {
            url: args.url,
            token: args.token,
            username: args.user,
        }
    }
}

#[derive(Parser)]
struct ChatArgs {
    #[command(flatten)]
    connect: ConnectArgs,

    /// Session to continue (default: start a new one)
    #[arg(short, long)]
    session: Option<String>,

    /// Model to ask (default: the relay's configured model)
    #[arg(short, long)]
    model: Option<String>,

    /// Send one message and exit instead of reading prompts from stdin
    message: Option<String>,
}

#[derive(Parser)]
struct SessionArgs {
    #[command(flatten)]
    connect: ConnectArgs,

    #[arg(short, long)]
    session: String,
}

#[derive(Parser)]
struct ResumeArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Replay fragments after this sequence number instead of the whole reply
    #[arg(long)]
    after: Option<u64>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub config: Arc<RelayConfig>,
    /// Streaming configuration
    pub chat_config: Arc<ChatConfig>,
    /// Authentication configuration
    pub auth_config: Arc<AuthConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub db: Arc<Database>,
    pub repository: Arc<ChatRepository>,
    pub multiplexer: Multiplexer,
}

/// Every route the relay serves, behind the auth middleware.
fn build_router(state: AppState) -> Router {
    let auth_state = AuthState {
        repository: state.repository.clone(),
        auth_config: state.auth_config.clone(),
    };

    Router::new()
        // Chat streaming
        .route("/api/chat", post(handlers::submit_chat))
        .route("/api/chat/{id}/stream", get(handlers::resume_chat))
        .route("/api/chat/{id}/cancel", post(handlers::cancel_chat))
        // Sessions
        .route("/api/sessions", get(handlers::list_sessions))
        .route(
            "/api/sessions/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        // Admin endpoints
        .route("/api/admin/stats", get(handlers::stats_handler))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        // Auth routes
        .merge(auth::auth_routes().with_state(auth_state.clone()))
        // Resolves the caller on every request (the local user when auth is off)
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            auth::auth_middleware,
        ))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => {
            let config = RelayConfig::new(cli.data_dir)?;
            run_server(args, config).await
        }
        Commands::AddUser(args) => {
            let config = RelayConfig::new(cli.data_dir)?;
            cli::add_user_command(&config, &args.username, args.display_name, args.password).await
        }
        Commands::Chat(args) => {
            cli::chat_command(&args.connect.into(), args.session, args.model, args.message).await
        }
        Commands::Resume(args) => {
            let session_id = args.session.session;
            cli::resume_command(&args.session.connect.into(), &session_id, args.after).await
        }
        Commands::Cancel(args) => {
            cli::cancel_command(&args.connect.into(), &args.session).await
        }
        Commands::Config => {
            let config = RelayConfig::new(cli.data_dir)?;
            let file_config: FileConfig = load_config(&config.data_dir).extract()?;
            print!("{}", toml::to_string_pretty(&file_config)?);
            Ok(())
        }
    }
}

async fn run_server(args: ServerArgs, config: RelayConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "relay=debug,chat_client=debug,tower_http=debug,info"
    } else {
        "relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting chat relay");

    let file_config: FileConfig = load_config(&config.data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {}", config.config_toml_path().display()))?;
    let config = Arc::new(config);

    // Initialize database
    info!("Initializing database...");
    let db = Arc::new(Database::new(&config).await?);
    let repository = Arc::new(ChatRepository::new(db.pool.clone()));

    let chat_config = ChatConfig::from_file(&file_config.chat);
    let source_config = SourceConfig::from_file(&file_config.source);
    let source = source::from_config(&source_config).context("Failed to set up text-generation source")?;
    info!(
        "Source: {:?} at {} (default model {}, stall timeout {:?})",
        source_config.kind, source_config.base_url, chat_config.default_model, chat_config.stall_timeout
    );

    let metrics = Arc::new(ServerMetrics::new());
    let multiplexer = Multiplexer::new(
        repository.clone(),
        source,
        chat_config.clone(),
        metrics.clone(),
    );

    // Nothing survives a restart; drop resume tokens the last run left behind
    multiplexer.recover_orphans().await?;

    let auth_config = Arc::new(AuthConfig::from_file(&file_config.auth));
    if auth_config.enabled {
        info!(
            "Authentication ENABLED (session TTL: {}s)",
            auth_config.session_ttl_secs
        );
    } else {
        info!("Authentication disabled; only loopback callers are served (set RELAY_AUTH__ENABLED=true to enable)");
    }

    let app_state = AppState {
        config: config.clone(),
        chat_config: Arc::new(chat_config),
        auth_config: auth_config.clone(),
        metrics,
        db: db.clone(),
        repository: repository.clone(),
        multiplexer: multiplexer.clone(),
    };

    // Spawn periodic expired token cleanup
    if auth_config.enabled {
        let cleanup_repo = repository.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                match cleanup_repo.cleanup_expired_tokens().await {
                    Ok(n) if n > 0 => info!("Cleaned up {} expired login tokens", n),
                    Ok(_) => {}
                    Err(e) => warn!("Failed to clean up expired login tokens: {:#}", e),
                }
            }
        });
    }

    let app = build_router(app_state);

    let host = args
        .host
        .or(file_config.server.host)
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = args.port.or(file_config.server.port).unwrap_or(DEFAULT_PORT);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Chat relay listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  POST   /api/chat               - Submit a message, stream the reply");
    info!("  GET    /api/chat/:id/stream    - Resume a streaming reply");
    info!("  POST   /api/chat/:id/cancel    - Cancel a streaming reply");
    info!("  GET    /api/sessions/:id       - Transcript and live generation");

    // Open event streams only end once their generation does, so shutting
    // down cancels every running generation first.
    let multiplexer_for_shutdown = multiplexer.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cancelling running generations...");
        let cancelled = multiplexer_for_shutdown.cancel_all().await;
        info!("Cancelled {} generations", cancelled);
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error");

    db.pool.close().await;
    info!("Shutdown complete");
    server_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStore;
    use crate::test_helpers::{self, ScriptedSource};
    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
    };
    use chat_convo::Message;
    use tower::ServiceExt;

    fn chat_request(token: Option<&str>) -> Request<Body> {
        let body = serde_json::json!({
            "id": "s1",
            "model": "m",
            "messages": [Message::user("hi")],
        });
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn unauthenticated_chat_never_reaches_source() {
        let source = Arc::new(ScriptedSource::new());
        let (mut state, _tmp) = test_helpers::test_app_state_with_source(source.clone()).await;
        state.auth_config = Arc::new(AuthConfig {
            enabled: true,
            session_ttl_secs: 3600,
        });
        let router = build_router(state.clone());

        for token in [None, Some("not-a-real-token")] {
            let response = router.clone().oneshot(chat_request(token)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        assert_eq!(source.calls(), 0);
        assert!(state.repository.get("s1").await.unwrap().is_none());

        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
