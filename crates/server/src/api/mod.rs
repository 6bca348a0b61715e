//! The HTTP surface: one module per route family, a shared `Arc<App>`
//! state, and a CORS + trace layer — modeled on the teacher's
//! `agent::api::build_router`.

pub mod error;
mod managers;
mod molecules;
mod records;
mod tasks;

use axum::routing::{get, post};
use axum::Router;
use gridserve_core::IdSource;
use std::sync::Arc;

use crate::config::Config;

pub struct App {
    pub pool: sqlx::PgPool,
    pub ids: IdSource,
    pub config: Config,
}

pub type SharedApp = Arc<App>;

pub fn build_router(pool: sqlx::PgPool, ids: IdSource, config: Config) -> anyhow::Result<Router<()>> {
    let allow_origin = config
        .allow_origin
        .iter()
        .map(|origin| origin.parse())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| anyhow::anyhow!("failed to parse an allowed CORS origin: {err}"))?;

    let cors = tower_http::cors::CorsLayer::new()
        .allow_methods(tower_http::cors::AllowMethods::mirror_request())
        .allow_origin(tower_http::cors::AllowOrigin::list(allow_origin))
        .allow_headers(tower_http::cors::AllowHeaders::mirror_request());

    let app = Arc::new(App { pool, ids, config });

    let router = Router::new()
        .route("/v1/molecules", post(molecules::add_molecules))
        .route("/v1/molecules/:id", get(molecules::get_molecule))
        .route("/v1/records", post(records::create_record))
        .route("/v1/records/query", post(records::query_records))
        .route("/v1/records/:id", get(records::get_record))
        .route("/v1/records/:id/history", get(records::get_history))
        .route("/v1/records/:id/cancel", post(records::cancel_record))
        .route("/v1/records/:id/uncancel", post(records::uncancel_record))
        .route("/v1/records/:id/invalidate", post(records::invalidate_record))
        .route("/v1/records/:id/delete", post(records::soft_delete_record))
        .route("/v1/records/:id/undelete", post(records::undelete_record))
        .route("/v1/records/:id/reset", post(records::reset_record))
        .route("/v1/records/:id/harddelete", post(records::hard_delete_record))
        .route("/v1/tasks/claim", post(tasks::claim_tasks))
        .route("/v1/tasks/return", post(tasks::return_results))
        .route("/v1/managers/activate", post(managers::activate))
        .route("/v1/managers/:name/heartbeat", post(managers::heartbeat))
        .route("/v1/managers/:name/deactivate", post(managers::deactivate))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app);

    Ok(router)
}
