//! # Aurora Server
//!
//! The control-plane binary. One executable, three roles:
//!
//! - `aurora serve` — the HTTP + WebSocket boundary surface.
//! - `aurora worker` — queue workers plus the periodic schedulers.
//! - `aurora init-superuser` — bootstrap the first operator account.
//!
//! Configuration arrives exclusively through environment variables
//! (see `aurora_core::config::Settings`); `.env` files are honored.

mod errors;
mod handlers;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aurora_core::queue::{Scheduler, Worker};
use aurora_core::reconcile::Engine;
use aurora_core::storage::Storage;
use aurora_core::stream::StreamBus;
use aurora_core::{Database, Settings};

use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "aurora")]
#[command(about = "Multi-server port-forwarding control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP + WebSocket API surface.
    Serve {
        #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
        host: String,
        #[arg(short, long, env = "SERVER_PORT", default_value_t = 8000)]
        port: u16,
    },
    /// Run queue workers and the periodic schedulers.
    Worker,
    /// Create the first superuser account.
    InitSuperuser {
        #[arg(long, env = "SUPERUSER_EMAIL")]
        email: String,
        #[arg(long, env = "SUPERUSER_PASSWORD")]
        password: String,
    },
}

async fn build_engine(settings: &Settings) -> anyhow::Result<Arc<Engine>> {
    let db = Database::connect(&settings.database_url)
        .await
        .context("connecting to Postgres")?;
    db.migrate().await.context("running migrations")?;

    let bus = StreamBus::connect(settings)
        .await
        .context("connecting the stream bus")?;
    let queue =
        aurora_core::queue::JobQueue::connect(settings, bus.clone())
            .await
            .context("connecting the job queue")?;
    let storage = Storage::new(settings.file_storage_path.clone());

    Ok(Arc::new(Engine::new(
        db,
        queue,
        bus,
        storage,
        settings.clone(),
    )))
}

async fn run_serve(
    settings: Settings,
    host: String,
    port: u16,
) -> anyhow::Result<()> {
    let engine = build_engine(&settings).await?;
    let state = AppState::new(engine);
    let app = routes::router(state);

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid listen address")?;
    info!("Aurora API listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn run_worker(settings: Settings) -> anyhow::Result<()> {
    let engine = build_engine(&settings).await?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let scheduler =
        Scheduler::new(engine.queue().clone(), &settings);
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(
        scheduler.run(shutdown_tx.subscribe()),
    ));

    for ident in 0..settings.worker_count {
        let worker = Worker::new(
            engine.queue().clone(),
            engine.clone(),
            ident,
        );
        tasks.push(tokio::spawn(worker.run(shutdown_tx.subscribe())));
    }
    info!(
        workers = settings.worker_count,
        "Aurora worker runtime started"
    );

    shutdown_signal().await;
    info!("Shutdown signal received, draining workers");
    let _ = shutdown_tx.send(());
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

async fn run_init_superuser(
    settings: Settings,
    email: String,
    password: String,
) -> anyhow::Result<()> {
    use argon2::password_hash::{SaltString, rand_core::OsRng};
    use argon2::{Argon2, PasswordHasher};

    let db = Database::connect(&settings.database_url).await?;
    db.migrate().await?;

    if db.get_user_by_email(&email).await?.is_some() {
        anyhow::bail!("user {email} already exists");
    }

    let salt = SaltString::generate(&mut OsRng);
    let hashed = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?
        .to_string();

    let user = db.create_superuser(&email, &hashed).await?;
    info!(user = user.id, %email, "Superuser created");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    if settings.enable_sentry {
        // Error forwarding is a deployment concern; handlers already
        // log failures, so this only marks the environment.
        info!(
            environment = %settings.environment,
            "Error forwarding enabled"
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match cli.command {
            Command::Serve { host, port } => {
                run_serve(settings, host, port).await
            }
            Command::Worker => run_worker(settings).await,
            Command::InitSuperuser { email, password } => {
                run_init_superuser(settings, email, password).await
            }
        }
    })
}
