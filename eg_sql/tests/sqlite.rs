//! ABOUTME: End-to-end tests of the instrumented handle over an in-memory sqlite pool
//! ABOUTME: Exercises the sqlx handle through the public connect constructors

use std::sync::Arc;

use eg_config::DatabaseConfig;
use eg_metrics::MetricsRegistry;
use eg_sql::{InstrumentedDb, PoolSettings, SqlxHandleError};
use sqlx::Row;
use test_support::sample_value;

fn single_connection() -> PoolSettings {
    PoolSettings {
        max_open_conns: 1,
        ..PoolSettings::default()
    }
}

#[tokio::test]
async fn test_sqlite_round_trip_is_instrumented() {
    let registry = Arc::new(MetricsRegistry::new());
    let db = InstrumentedDb::connect_with("sqlite::memory:", single_connection(), registry.clone())
        .unwrap();

    db.exec(
        "CREATE TABLE hosts (name TEXT PRIMARY KEY, port INTEGER NOT NULL)",
        &[],
    )
    .await
    .unwrap();
    db.exec(
        "INSERT INTO hosts (name, port) VALUES (?, ?)",
        &["example.com".into(), 443.into()],
    )
    .await
    .unwrap();

    let row = db
        .query_row("SELECT port FROM hosts WHERE name = ?", &["example.com".into()])
        .await
        .unwrap();
    assert_eq!(row.get::<i64, _>("port"), 443);

    let text = registry.encode().unwrap();
    assert_eq!(
        sample_value(
            &text,
            "sql_command_duration_seconds_count{driver=\"sqlite\",database=\":memory:\",host=\"localhost\",command=\"query_row\",query=\"SELECT port FROM hosts WHERE name = ?\"}"
        ),
        Some(1.0)
    );
    assert_eq!(
        sample_value(
            &text,
            "sql_stats_connections_open{driver=\"sqlite\",database=\":memory:\",host=\"localhost\"}"
        ),
        Some(1.0)
    );
    assert_eq!(
        sample_value(
            &text,
            "sql_stats_connections_max_open{driver=\"sqlite\",database=\":memory:\",host=\"localhost\"}"
        ),
        Some(1.0)
    );

    db.close().await.unwrap();
    let err = db.ping().await.unwrap_err();
    assert!(matches!(err, SqlxHandleError::Sqlx(sqlx::Error::PoolClosed)));
}

#[tokio::test]
async fn test_from_config() {
    let registry = Arc::new(MetricsRegistry::new());
    let config = DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_open_conns: 1,
        ..DatabaseConfig::default()
    };

    let db = InstrumentedDb::from_config(&config, registry.clone()).unwrap();
    db.ping().await.unwrap();
    assert_eq!(db.stats().max_open, 1);
    assert_eq!(db.inner().settings().max_idle_conns, 2);

    db.close().await.unwrap();
    assert_eq!(registry.source_count(), 0);
}

#[tokio::test]
async fn test_setters_keep_in_memory_database() {
    let registry = Arc::new(MetricsRegistry::new());
    let db = InstrumentedDb::connect_with("sqlite::memory:", single_connection(), registry.clone())
        .unwrap();

    db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
        .await
        .unwrap();
    db.exec("INSERT INTO t (id) VALUES (?)", &[1.into()])
        .await
        .unwrap();
    assert_eq!(db.stats().open, 1);

    db.set_conn_max_lifetime(Some(std::time::Duration::from_secs(3600)));
    db.set_conn_max_idle_time(Some(std::time::Duration::from_secs(600)));
    db.set_max_open_conns(1);
    db.set_max_idle_conns(1);

    assert_eq!(db.stats().open, 1);
    let row = db.query_row("SELECT COUNT(*) AS n FROM t", &[]).await.unwrap();
    assert_eq!(row.get::<i64, _>("n"), 1);

    db.close().await.unwrap();
}
