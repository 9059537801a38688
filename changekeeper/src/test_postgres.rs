//! Shared PostgreSQL container for the `postgres` tests.
//!
//! One container is started per test binary; every test gets its own database in it.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Once, OnceLock};

use postgres::{Client, NoTls};
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

use crate::postgres::PostgresBackend;

static POSTGRES_PORT: AtomicU16 = AtomicU16::new(0);

static POSTGRES_INIT: Once = Once::new();

/// Keeps the runtime that owns the container alive for the whole test run.
static TOKIO_RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();

// testcontainers-modules defaults
const PG_USER: &str = "postgres";
const PG_PASSWORD: &str = "postgres";
const PG_DB: &str = "postgres";

fn postgres_port() -> u16 {
    POSTGRES_INIT.call_once(|| {
        let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");

        let port = rt.block_on(async {
            let container = Postgres::default()
                .start()
                .await
                .expect("failed to start postgres container");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("failed to get postgres port");
            // leaked so the container outlives every test
            std::mem::forget(container);
            port
        });

        POSTGRES_PORT.store(port, Ordering::SeqCst);
        let _ = TOKIO_RT.set(rt);
    });
    POSTGRES_PORT.load(Ordering::SeqCst)
}

fn url_with_db(db: &str) -> String {
    format!(
        "postgres://{}:{}@127.0.0.1:{}/{}",
        PG_USER,
        PG_PASSWORD,
        postgres_port(),
        db
    )
}

/// Create a uniquely named database. Returns its URL and name.
pub fn fresh_postgres_db() -> (String, String) {
    let mut admin =
        Client::connect(&url_with_db(PG_DB), NoTls).expect("failed to connect as admin");
    let db_name = format!("test_{}", Uuid::new_v4().simple());
    admin
        .execute(&format!("CREATE DATABASE \"{}\"", db_name), &[])
        .expect("failed to create test database");
    drop(admin);

    (url_with_db(&db_name), db_name)
}

/// A backend connected to a fresh database.
pub fn get_test_backend() -> PostgresBackend {
    let (url, _db_name) = fresh_postgres_db();
    let client = Client::connect(&url, NoTls).expect("failed to connect to test database");
    PostgresBackend::new(client)
}
