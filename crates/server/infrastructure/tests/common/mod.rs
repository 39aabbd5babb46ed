#![allow(dead_code)]

use cube_castle_sync_infrastructure::PostgresOutboxRepository;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool};
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// One container per test binary; every test gets its own database.
struct SharedPostgres {
    _container: ContainerAsync<Postgres>,
    admin_url: String,
    host: String,
    port: u16,
}

static SHARED_POSTGRES: OnceCell<SharedPostgres> = OnceCell::const_new();

pub struct OutboxTestDatabase {
    pub url: String,
    pub pool: PgPool,
    pub repository: PostgresOutboxRepository,
    db_name: String,
    admin_url: String,
}

impl Drop for OutboxTestDatabase {
    fn drop(&mut self) {
        let db_name = self.db_name.clone();
        let admin_url = self.admin_url.clone();
        let pool = self.pool.clone();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        handle.spawn(async move {
            pool.close().await;
            let Ok(mut conn) = PgConnection::connect(&admin_url).await else {
                return;
            };
            let _ = sqlx::query(&format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", db_name))
                .execute(&mut conn)
                .await;
        });
    }
}

async fn shared_postgres() -> &'static SharedPostgres {
    SHARED_POSTGRES
        .get_or_init(|| async {
            let container = Postgres::default()
                .with_tag("16-alpine")
                .start()
                .await
                .expect("Failed to start Postgres container");

            let host = container
                .get_host()
                .await
                .expect("Failed to get host")
                .to_string();
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("Failed to get port");

            SharedPostgres {
                _container: container,
                admin_url: format!("postgres://postgres:postgres@{}:{}/postgres", host, port),
                host,
                port,
            }
        })
        .await
}

/// Fresh database with the outbox schema applied.
pub async fn outbox_database() -> OutboxTestDatabase {
    let shared = shared_postgres().await;
    let db_name = format!("outbox_{}", Uuid::new_v4().simple());

    let mut admin = PgConnection::connect(&shared.admin_url)
        .await
        .expect("Failed to connect to postgres admin db");
    sqlx::query(&format!("CREATE DATABASE {}", db_name))
        .execute(&mut admin)
        .await
        .expect("Failed to create test database");

    let url = format!(
        "postgres://postgres:postgres@{}:{}/{}",
        shared.host, shared.port, db_name
    );
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("Failed to connect to test database");

    let repository = PostgresOutboxRepository::new(pool.clone());
    repository
        .run_migrations()
        .await
        .expect("Failed to create outbox schema");

    OutboxTestDatabase {
        url,
        pool,
        repository,
        db_name,
        admin_url: shared.admin_url.clone(),
    }
}
