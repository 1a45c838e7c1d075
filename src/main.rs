use axum::{
    routing::{get, post},
    Router,
};
use examhall_backend::services::broadcast::attempt_topic;
use examhall_backend::ws::messages::ServerMessage;
use examhall_backend::{
    config::{get_config, init_config},
    database::pool::create_pool,
    middleware, routes, ws, AppState,
};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "examhall_backend=info,tower_http=info".into()),
        )
        .init();
    init_config()?;
    let config = get_config();

    let pool = create_pool().await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let app_state = AppState::new(pool);

    // Attempt expiry sweeper: overrun attempts flip to expired and
    // every connected device hears about it through the bridge.
    {
        let state = app_state.clone();
        tokio::spawn(async move {
            loop {
                match state.store.expire_overdue_attempts().await {
                    Ok(expired) => {
                        for attempt_id in expired {
                            tracing::info!(%attempt_id, "attempt expired");
                            let message = ServerMessage::exam_event(
                                "time_expired",
                                json!({
                                    "message": "Exam time has expired. Please submit your exam."
                                }),
                            );
                            if let Err(e) = state
                                .bridge
                                .publish(&attempt_topic(attempt_id), &message)
                                .await
                            {
                                tracing::error!(%attempt_id, error = %e, "failed to publish expiry event");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "attempt expiry sweep error");
                    }
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });
    }

    let base_routes = Router::new()
        .route("/health", get(routes::health::health))
        .route(
            "/api/session/attempts/:id",
            get(ws::session::attempt_session),
        );

    let protected_api = Router::new()
        .route(
            "/api/transfers",
            get(routes::transfer::list_transfers).post(routes::transfer::create_transfer),
        )
        .route("/api/transfers/:id", get(routes::transfer::get_transfer))
        .route(
            "/api/transfers/:id/approve",
            post(routes::transfer::approve_transfer),
        )
        .route(
            "/api/transfers/:id/reject",
            post(routes::transfer::reject_transfer),
        )
        .route(
            "/api/attempts/:id/time",
            get(routes::attempt::get_attempt_time),
        )
        .layer(axum::middleware::from_fn(
            middleware::auth::require_bearer_auth,
        ));

    let app = base_routes
        .merge(protected_api)
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.server_address.parse()?;
    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
