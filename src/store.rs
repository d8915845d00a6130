//! Collection metadata table and database bootstrap. `_sys_collections` lives in the schema
//! named by `PROVISION_SCHEMA` (default `public`) next to the collections it describes.

use crate::config::Collation;
use crate::error::DbError;
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, PgConnection, PgPool};
use std::str::FromStr;

pub const SYS_COLLECTIONS: &str = "_sys_collections";

/// Quote an identifier for PostgreSQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for PostgreSQL, for the few places that cannot take bind parameters (DDL).
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Schema-qualified, quoted name (e.g. `"public"."invoices"`).
pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Create the schema if missing, then `_sys_collections`.
pub async fn ensure_sys_tables(pool: &PgPool, schema: &str) -> Result<(), DbError> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))
        .execute(pool)
        .await?;
    let ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            name TEXT PRIMARY KEY,
            collation JSONB NOT NULL,
            validator JSONB,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        qualified(schema, SYS_COLLECTIONS)
    );
    tracing::debug!(sql = %ddl, "query");
    sqlx::query(&ddl).execute(pool).await?;
    Ok(())
}

/// Record a collection and its collation. Keeps an existing validator.
pub async fn upsert_collection_meta(
    conn: &mut PgConnection,
    schema: &str,
    name: &str,
    collation: &Collation,
) -> Result<(), DbError> {
    let collation = serde_json::to_value(collation).unwrap_or_default();
    sqlx::query(&format!(
        "INSERT INTO {} (name, collation, updated_at) VALUES ($1, $2, NOW()) \
         ON CONFLICT (name) DO UPDATE SET collation = EXCLUDED.collation, updated_at = NOW()",
        qualified(schema, SYS_COLLECTIONS)
    ))
    .bind(name)
    .bind(collation)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Replace the stored validator; inserts a metadata row with the default collation if none exists.
pub async fn replace_validator(
    conn: &mut PgConnection,
    schema: &str,
    name: &str,
    validator: &serde_json::Value,
) -> Result<(), DbError> {
    let collation = serde_json::to_value(Collation::default()).unwrap_or_default();
    sqlx::query(&format!(
        "INSERT INTO {} (name, collation, validator, updated_at) VALUES ($1, $2, $3, NOW()) \
         ON CONFLICT (name) DO UPDATE SET validator = EXCLUDED.validator, updated_at = NOW()",
        qualified(schema, SYS_COLLECTIONS)
    ))
    .bind(name)
    .bind(collation)
    .bind(validator)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn load_validator(
    conn: &mut PgConnection,
    schema: &str,
    name: &str,
) -> Result<Option<serde_json::Value>, DbError> {
    let row: Option<(Option<serde_json::Value>,)> = sqlx::query_as(&format!(
        "SELECT validator FROM {} WHERE name = $1",
        qualified(schema, SYS_COLLECTIONS)
    ))
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.and_then(|r| r.0))
}

/// Collation recorded for the collection; `None` for tables created outside this crate.
pub async fn load_collation(
    conn: &mut PgConnection,
    schema: &str,
    name: &str,
) -> Result<Option<Collation>, DbError> {
    let row: Option<(serde_json::Value,)> = sqlx::query_as(&format!(
        "SELECT collation FROM {} WHERE name = $1",
        qualified(schema, SYS_COLLECTIONS)
    ))
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(|r| parse_collation(name, r.0)).transpose()
}

/// A stored collation that does not parse is an error, never silently replaced by none.
fn parse_collation(name: &str, raw: serde_json::Value) -> Result<Collation, DbError> {
    serde_json::from_value(raw).map_err(|e| DbError::Metadata {
        collection: name.to_string(),
        message: format!("collation: {}", e),
    })
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// default `postgres` database to run CREATE DATABASE. Call before creating the main pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), DbError> {
    let (admin, db_name) = admin_options(database_url)?;
    let Some(db_name) = db_name.filter(|n| n != "postgres") else {
        return Ok(());
    };
    let mut conn: PgConnection = admin.connect().await?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await?;
    if !exists.0 {
        tracing::info!("creating database {}", db_name);
        sqlx::query(&format!("CREATE DATABASE {}", quote_ident(&db_name)))
            .execute(&mut conn)
            .await?;
    }
    Ok(())
}

/// Options for the `postgres` maintenance database plus the database named by the URL, if any.
fn admin_options(database_url: &str) -> Result<(PgConnectOptions, Option<String>), DbError> {
    let opts = PgConnectOptions::from_str(database_url)?;
    let db_name = opts
        .get_database()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    Ok((opts.database("postgres"), db_name))
}
