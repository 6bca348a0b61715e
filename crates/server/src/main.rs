//! `gridserve`: the compute scheduler server binary. Bootstraps the
//! database pool, the id generator, the HTTP API, and the background
//! sweep loops that keep managers honest and services moving — the same
//! shape as the teacher's `agent::main`, minus its connector-specific
//! bootstrapping.

mod api;
mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::Config;
use futures::FutureExt;
use gridserve_core::IdSource;
use rand::Rng;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about = "gridserve compute scheduler", long_about = None)]
struct Args {
    /// Path to a YAML config file. Falls back to built-in defaults, then
    /// the DATABASE_URL environment variable, if absent.
    #[clap(long, env = "GRIDSERVE_CONFIG")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the API server and background sweeps.
    Start,
    /// Apply pending database migrations and exit.
    UpgradeDb,
    /// Print the default configuration as YAML and exit.
    InitConfig,
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    if matches!(args.command, Command::InitConfig) {
        print!("{}", Config::default().to_yaml()?);
        return Ok(());
    }

    let no_color = matches!(std::env::var("NO_COLOR"), Ok(v) if v == "1");
    let config = Config::load(args.config.as_deref())?;

    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_ansi(!no_color)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async_main(args.command, config));
    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result
}

async fn async_main(command: Command, config: Config) -> Result<(), anyhow::Error> {
    let pg_pool = sqlx::postgres::PgPoolOptions::new()
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;

    match command {
        Command::UpgradeDb => {
            sqlx::migrate!("../../migrations")
                .run(&pg_pool)
                .await
                .context("running database migrations")?;
            tracing::info!("database migrations applied");
            return Ok(());
        }
        Command::InitConfig => unreachable!("handled before connecting to the database"),
        Command::Start => {}
    }

    // Range starts at 1 because 0 is reserved for ids minted directly in SQL.
    let id_shard = rand::thread_rng().gen_range(1u16..1024u16);
    let ids = IdSource::new(id_shard);

    let api_listener = tokio::net::TcpListener::bind(("0.0.0.0", config.api_port))
        .await
        .context("failed to bind API port")?;

    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    let router = api::build_router(pg_pool.clone(), ids, config.clone())?;
    let api_server = axum::serve(api_listener, router).with_graceful_shutdown(shutdown.clone());
    let api_server = async move { anyhow::Result::Ok(api_server.await?) };

    let manager_sweep = manager_sweep_loop(pg_pool.clone(), config.clone(), shutdown.clone());
    let service_sweep = service_sweep_loop(pg_pool.clone(), config.clone(), shutdown.clone());

    let ((), (), ()) = tokio::try_join!(api_server, manager_sweep, service_sweep)?;
    Ok(())
}

/// Periodically marks managers whose heartbeat has lapsed as inactive and
/// reclaims their in-flight records (§4.6).
async fn manager_sweep_loop(
    pool: sqlx::PgPool,
    config: Config,
    shutdown: impl std::future::Future<Output = ()> + Clone,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(config.heartbeat_period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let mut conn = pool.acquire().await?;
                match gridserve_core::manager::sweep_inactive(
                    &mut conn,
                    config.heartbeat_period,
                    config.heartbeat_max_missed,
                )
                .await
                {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        tracing::warn!(managers = ?reclaimed, "reclaimed work from missed-heartbeat managers");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = ?err, "manager sweep failed"),
                }
            }
            _ = shutdown.clone() => return Ok(()),
        }
    }
}

/// Periodically advances every eligible service by one wave (§4.4). Uses
/// `SKIP LOCKED` claiming (via `service::find_eligible`) so this loop can
/// run on every server replica without double-stepping a service.
async fn service_sweep_loop(
    pool: sqlx::PgPool,
    config: Config,
    shutdown: impl std::future::Future<Output = ()> + Clone,
) -> anyhow::Result<()> {
    let ids = IdSource::new(rand::thread_rng().gen_range(1u16..1024u16));
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let mut tx = match pool.begin().await {
                    Ok(tx) => tx,
                    Err(err) => {
                        tracing::error!(error = ?err, "failed to open a transaction for service sweep");
                        continue;
                    }
                };
                // `find_eligible`'s SKIP LOCKED select and every subsequent
                // `iterate_one` run inside this one transaction, so the row
                // locks it takes actually span the whole sweep instead of
                // releasing the instant the SELECT returns.
                let eligible = match gridserve_core::service::find_eligible(&mut tx, config.service_concurrency).await {
                    Ok(eligible) => eligible,
                    Err(err) => {
                        tracing::error!(error = ?err, "failed to list eligible services");
                        continue;
                    }
                };
                for record_id in eligible {
                    if let Err(err) = gridserve_core::service::iterate_one(&mut tx, &ids, record_id).await {
                        tracing::error!(error = ?err, %record_id, "service iteration failed");
                    }
                }
                if let Err(err) = tx.commit().await {
                    tracing::error!(error = ?err, "failed to commit service sweep transaction");
                }
            }
            _ = shutdown.clone() => return Ok(()),
        }
    }
}
