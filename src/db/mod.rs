use anyhow::{Context, Result};
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection};
use diesel::sql_query;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::models::deposit_event::DepositEvent;
use crate::models::trade::{NewTrade, Trade};
use crate::models::user::User;
use crate::schema::{deposit_events, trades};

pub type DbPool = r2d2::Pool<ConnectionManager<SqliteConnection>>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Connection customizer applying the PRAGMAs every pooled connection needs.
#[derive(Debug, Clone)]
struct SqlitePragmaCustomizer;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        sql_query("PRAGMA foreign_keys = ON;")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;

        // WAL keeps readers unblocked while the reconciler holds a write txn
        sql_query("PRAGMA journal_mode = WAL;")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;

        // Wait up to 5 seconds for locks instead of failing immediately
        sql_query("PRAGMA busy_timeout = 5000;")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;

        sql_query("PRAGMA synchronous = NORMAL;")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;

        Ok(())
    }
}

/// Create the database connection pool.
pub fn create_pool(database_url: &str) -> Result<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);

    let pool = r2d2::Pool::builder()
        .max_size(30)
        .connection_timeout(std::time::Duration::from_secs(30))
        .connection_customizer(Box::new(SqlitePragmaCustomizer))
        .build(manager)
        .context("Failed to create database connection pool")?;

    Ok(pool)
}

/// Apply pending embedded migrations.
pub fn run_migrations(pool: &DbPool) -> Result<()> {
    let mut conn = pool.get().context("Failed to get DB connection")?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {e}"))?;
    if !applied.is_empty() {
        tracing::info!(count = applied.len(), "Applied database migrations");
    }
    Ok(())
}

/// Run a blocking diesel closure on the runtime's blocking pool.
///
/// Every async call site goes through here so diesel work never executes on
/// a reactor thread.
pub async fn db_blocking<T, F>(pool: &DbPool, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
{
    let mut conn = pool.get().context("Failed to get DB connection")?;
    tokio::task::spawn_blocking(move || f(&mut conn))
        .await
        .context("Database task panicked")?
}

pub async fn db_insert_trade(pool: &DbPool, new_trade: NewTrade) -> Result<Trade> {
    db_blocking(pool, move |conn| Trade::create(conn, new_trade)).await
}

pub async fn db_load_trade(pool: &DbPool, trade_id: &str) -> Result<Trade> {
    let id = trade_id.to_string();
    db_blocking(pool, move |conn| Trade::find_by_id(conn, &id)).await
}

pub async fn db_load_trade_by_escrow(pool: &DbPool, escrow_id: i64) -> Result<Option<Trade>> {
    db_blocking(pool, move |conn| {
        trades::table
            .filter(trades::escrow_id.eq(escrow_id))
            .first(conn)
            .optional()
            .context(format!("Failed to query trade for escrow {}", escrow_id))
    })
    .await
}

pub async fn db_load_user(pool: &DbPool, user_id: &str) -> Result<User> {
    let id = user_id.to_string();
    db_blocking(pool, move |conn| User::find_by_id(conn, &id)).await
}

pub async fn db_find_deposit_by_hash(pool: &DbPool, tx_hash: &str) -> Result<Option<DepositEvent>> {
    let hash = tx_hash.to_string();
    db_blocking(pool, move |conn| {
        deposit_events::table
            .filter(deposit_events::tx_hash.eq(&hash))
            .first(conn)
            .optional()
            .context(format!("Failed to query deposit event for tx {}", hash))
    })
    .await
}
