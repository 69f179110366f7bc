//! Versioned route organization.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{files, jobs, ports, rules, servers};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/servers",
            get(servers::list_servers).post(servers::create_server),
        )
        .route(
            "/servers/{server_id}",
            get(servers::get_server)
                .put(servers::update_server)
                .delete(servers::delete_server),
        )
        .route(
            "/servers/{server_id}/connect",
            post(servers::connect_server),
        )
        .route(
            "/servers/{server_id}/ports",
            get(ports::list_ports).post(ports::create_port),
        )
        .route(
            "/ports/{port_id}",
            get(ports::get_port)
                .put(ports::update_port)
                .delete(ports::delete_port),
        )
        .route(
            "/ports/{port_id}/usage/reset",
            post(ports::reset_port_usage),
        )
        .route(
            "/ports/{port_id}/rule",
            get(rules::get_rule)
                .post(rules::create_rule)
                .put(rules::update_rule)
                .delete(rules::delete_rule),
        )
        .route(
            "/ports/{port_id}/rule/artifacts",
            get(rules::rule_artifacts),
        )
        .route("/files", post(files::upload_file))
        .route("/files/{file_id}", get(files::get_file))
        .route("/jobs/{job_id}/status", get(jobs::job_status))
        .route("/jobs/{job_id}/cancel", post(jobs::cancel_job))
        .route("/jobs/{job_id}/stream", get(jobs::stream_job));

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
