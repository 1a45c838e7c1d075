use crate::config::get_config;
use crate::error::Result;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub async fn create_pool() -> Result<PgPool> {
    let config = get_config();
    // Sized above the HTTP worker count: the broadcast bridge checks out
    // one long-lived LISTEN connection per subscribed attempt topic.
    let pool = PgPoolOptions::new()
        .max_connections(64)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .connect(&config.database_url)
        .await?;
    Ok(pool)
}
