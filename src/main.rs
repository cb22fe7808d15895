//! DataForge Governor - Governed Query & App Generation Service
//!
//! Sits between untrusted generated artifacts and a production warehouse.
//! Every request runs a generate-validate-execute pipeline with a single
//! self-healing repair cycle:
//! - Generate: an adapter produces a SQL statement or app spec from intent
//! - Validate: static guardrail + role-policy checks, nothing unvalidated
//!   ever reaches the warehouse
//! - Execute: read-only execution with row caps enforced
//! - Heal: one repair attempt with the failure diagnostics, then give up
//!   safely with suggestions
//!
//! Every terminal outcome is audit-logged before the caller sees it.

mod audit;
mod config;
mod error;
mod pipeline;
mod policy;
mod routes;
mod state;
mod validate;

use crate::audit::{AuditRecorder, AuditSink, MemoryAuditSink, PgAuditSink};
use crate::config::{AuditBackend, Settings};
use crate::pipeline::adapters::{NativeSqlGenerator, PostgresExecutor};
use crate::pipeline::{Orchestrator, PipelineLimits};
use crate::policy::{PolicyPaths, PolicyStore};
use crate::routes::create_router;
use crate::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for structured logging
    init_tracing();

    info!("🚀 Starting DataForge Governor - Governed Query Service...");

    // Load configuration
    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");

    // Load governance policy - REQUIRED, the server must not start without it
    let policy = match PolicyStore::load(PolicyPaths {
        guardrails: settings.policy.guardrails_path.clone(),
        roles: settings.policy.roles_path.clone(),
    }) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("❌ FATAL: Failed to load governance policy: {}", e);
            error!(
                "Check {} and {}",
                settings.policy.guardrails_path.display(),
                settings.policy.roles_path.display()
            );
            anyhow::bail!("cannot start server without a valid policy");
        }
    };

    // Initialize warehouse pool - REQUIRED for execution and the default
    // audit sink
    let pool = match init_database_pool(&settings).await {
        Ok(pool) => {
            info!("✅ Warehouse pool created successfully");
            pool
        }
        Err(e) => {
            error!("❌ FATAL: Failed to initialize warehouse pool: {}", e);
            error!("DATABASE_URL must be set in .env and the warehouse must be accessible");
            anyhow::bail!("cannot start server without a warehouse connection");
        }
    };

    // Pick the audit sink
    let sink: Arc<dyn AuditSink> = match settings.audit_backend {
        AuditBackend::Postgres => {
            let sink = PgAuditSink::new(pool.clone());
            sink.ensure_table().await?;
            info!("✅ Audit table initialized");
            Arc::new(sink)
        }
        AuditBackend::Memory => {
            info!("⚠️  Using in-memory audit sink (records lost on restart)");
            Arc::new(MemoryAuditSink::new())
        }
    };
    let audit = Arc::new(AuditRecorder::new(sink));

    // Wire the pipeline: native generator over the governed schema, real
    // warehouse executor
    let generator = {
        let snapshot = policy.snapshot().await;
        Arc::new(NativeSqlGenerator::from_policy(&snapshot.document))
    };
    let executor = Arc::new(PostgresExecutor::new(pool));
    let orchestrator = Orchestrator::new(
        policy.clone(),
        generator,
        executor,
        audit.clone(),
        PipelineLimits {
            generation_timeout: settings.pipeline.generation_timeout,
            execution_timeout: settings.pipeline.execution_timeout,
            row_limit_mode: settings.pipeline.row_limit_mode,
        },
    );

    let state = Arc::new(AppState::new(policy, audit, orchestrator));

    // Build the router
    let app = create_router(state, &settings);

    // Create socket address
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   ─── Pipeline ───");
    info!("   POST /api/chat/query     - Run an intent through the governed pipeline");
    info!("   POST /api/factory/build  - Generate a governed app spec");
    info!("");
    info!("   ─── Governance ───");
    info!("   GET  /api/audit/recent   - Recent audit records (newest first)");
    info!("   GET  /api/policy         - Active policy snapshot");
    info!("   POST /api/policy/reload  - Hot-reload policy from disk");
    info!("");

    // Create TCP listener and serve
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dataforge_governor=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Initialize the warehouse pool from DATABASE_URL
async fn init_database_pool(settings: &Settings) -> anyhow::Result<deadpool_postgres::Pool> {
    let database_url = settings
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL not set in environment or .env file"))?;

    // Parse the DATABASE_URL using tokio_postgres::Config
    let config = database_url
        .parse::<tokio_postgres::Config>()
        .map_err(|e| anyhow::anyhow!("Failed to parse DATABASE_URL: {}", e))?;

    let hosts = config.get_hosts();
    let host = match hosts.first() {
        Some(tokio_postgres::config::Host::Tcp(s)) => s.clone(),
        Some(tokio_postgres::config::Host::Unix(_)) => {
            anyhow::bail!("Unix socket connections are not supported");
        }
        None => anyhow::bail!("No host in DATABASE_URL"),
    };
    let port = config.get_ports().first().copied().unwrap_or(5432);
    let user = config
        .get_user()
        .map(|u| u.to_string())
        .ok_or_else(|| anyhow::anyhow!("No user in DATABASE_URL"))?;
    let password = config
        .get_password()
        .map(|p| String::from_utf8_lossy(p).to_string())
        .unwrap_or_default();
    let database = config
        .get_dbname()
        .map(|db| db.to_string())
        .ok_or_else(|| anyhow::anyhow!("No database name in DATABASE_URL"))?;

    use deadpool_postgres::{Config, ManagerConfig, RecyclingMethod};

    let mut cfg = Config::new();
    cfg.host = Some(host);
    cfg.port = Some(port);
    cfg.user = Some(user);
    cfg.password = Some(password);
    cfg.dbname = Some(database);
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let pool = cfg
        .create_pool(Some(deadpool_postgres::Runtime::Tokio1), tokio_postgres::NoTls)
        .map_err(|e| anyhow::anyhow!("Failed to create pool: {}", e))?;

    // Test the connection
    let client = pool
        .get()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get pool connection: {}", e))?;
    let _row = client
        .query_one("SELECT 1 as ok", &[])
        .await
        .map_err(|e| anyhow::anyhow!("Failed to verify warehouse connection: {}", e))?;

    info!("✅ Warehouse connection verified");
    Ok(pool)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
