mod admin;
mod middleware;
mod proxy;

use std::sync::Arc;

use axum::routing::{delete, get, patch, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use kirogate_core::AppContext;

pub use middleware::request_id_from_headers;

/// Full application router: client endpoints, group-scoped variants, the
/// admin surface, and health.
pub fn app_router(ctx: Arc<AppContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Client endpoints.
        .route("/v1/messages", post(proxy::messages))
        .route("/v1/messages/count_tokens", post(proxy::count_tokens))
        .route("/v1/chat/completions", post(proxy::chat_completions))
        .route("/v1/models", get(proxy::models))
        // Group-scoped variants; `api` and `static` fall through inside the
        // handlers as reserved path heads.
        .route("/{group}/v1/messages", post(proxy::messages_for_group))
        .route(
            "/{group}/v1/chat/completions",
            post(proxy::chat_completions_for_group),
        )
        .route("/{group}/v1/models", get(proxy::models_for_group))
        // Admin surface.
        .route("/api/tokens", get(admin::list_tokens).post(admin::add_token))
        .route("/api/tokens/bulk", post(admin::add_tokens_bulk))
        .route("/api/tokens/refresh", post(admin::refresh_tokens))
        .route(
            "/api/tokens/{id}",
            delete(admin::delete_token).patch(admin::update_token),
        )
        .route("/api/tokens/{id}/move", put(admin::move_token))
        .route("/api/groups", get(admin::list_groups).post(admin::create_group))
        .route(
            "/api/groups/{name}",
            put(admin::update_group).delete(admin::delete_group),
        )
        .route("/api/groups/{name}/rename", post(admin::rename_group))
        .route("/api/keys", get(admin::list_keys).post(admin::create_key))
        .route(
            "/api/keys/{key}",
            patch(admin::update_key).delete(admin::delete_key),
        )
        .route(
            "/api/settings",
            get(admin::get_settings).post(admin::update_settings),
        )
        .route("/api/stats", get(admin::stats))
        .route("/api/logs", get(admin::logs))
        // Health is unauthenticated.
        .route("/health", get(proxy::health))
        .layer(axum::middleware::from_fn_with_state(
            ctx.clone(),
            middleware::rate_limit,
        ))
        .layer(axum::middleware::from_fn_with_state(
            ctx.clone(),
            middleware::api_key_auth,
        ))
        .layer(axum::middleware::from_fn(middleware::request_id))
        .layer(cors)
        .with_state(ctx)
}
