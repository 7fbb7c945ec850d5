//! Shared fixtures for offline end-to-end tests
//!
//! Every test gets its own tempfile-backed SQLite database with the
//! embedded migrations applied; no network, no shared state between tests.

#![allow(dead_code)]

use chrono::{Duration, NaiveDateTime, Utc};
use uuid::Uuid;

use server::db::{create_pool, run_migrations, DbPool};
use server::models::trade::{NewTrade, Trade};
use server::models::user::{NewUser, User};
use server::services::correlator::{DepositSource, InboundDeposit};
use server::services::state_machine::TradeStatus;

pub struct TestDb {
    pub pool: DbPool,
    _dir: tempfile::TempDir,
}

pub fn setup() -> TestDb {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let db_path = dir.path().join("test.db");
    let pool = create_pool(db_path.to_str().unwrap()).expect("create pool");
    run_migrations(&pool).expect("run migrations");
    TestDb { pool, _dir: dir }
}

pub fn insert_user(pool: &DbPool, username: &str) -> User {
    let mut conn = pool.get().unwrap();
    User::create(&mut conn, NewUser::with_username(username)).expect("create user")
}

pub fn insert_trade(pool: &DbPool, buyer: &User, seller: &User, amount: i64) -> Trade {
    insert_trade_with_deadlines(
        pool,
        buyer,
        seller,
        amount,
        Utc::now().naive_utc() + Duration::hours(1),
        Utc::now().naive_utc() + Duration::hours(24),
    )
}

pub fn insert_trade_with_deadlines(
    pool: &DbPool,
    buyer: &User,
    seller: &User,
    amount: i64,
    funding_deadline: NaiveDateTime,
    trade_deadline: NaiveDateTime,
) -> Trade {
    let mut conn = pool.get().unwrap();
    let escrow_id = Trade::next_escrow_id(&mut conn).expect("allocate escrow id");
    let now = Utc::now().naive_utc();
    Trade::create(
        &mut conn,
        NewTrade {
            id: Uuid::new_v4().to_string(),
            escrow_id,
            buyer_id: buyer.id.clone(),
            seller_id: seller.id.clone(),
            amount,
            fiat_currency: "USD".to_string(),
            fiat_price: 1_000_000,
            status: TradeStatus::PendingFunding.as_str().to_string(),
            funded_amount: 0,
            excess_amount: 0,
            version: 0,
            created_at: now,
            funding_deadline,
            trade_deadline,
            updated_at: now,
        },
    )
    .expect("create trade")
}

pub fn reload_trade(pool: &DbPool, trade_id: &str) -> Trade {
    let mut conn = pool.get().unwrap();
    Trade::find_by_id(&mut conn, trade_id).expect("reload trade")
}

pub fn reload_user(pool: &DbPool, user_id: &str) -> User {
    let mut conn = pool.get().unwrap();
    User::find_by_id(&mut conn, user_id).expect("reload user")
}

pub fn deposit(source: DepositSource, tx_hash: &str, amount: i64, memo: &str) -> InboundDeposit {
    InboundDeposit {
        source,
        tx_hash: tx_hash.to_string(),
        sender_address: "TSenderWalletAddress001".to_string(),
        amount,
        memo: memo.to_string(),
        observed_at: Utc::now().naive_utc(),
    }
}
