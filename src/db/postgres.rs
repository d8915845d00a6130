//! PostgreSQL backend. Each collection is a table `(id UUID, doc JSONB, created_at)` in the
//! configured schema; collation and validator are kept in `_sys_collections`. Index
//! expressions are `(doc #>> ARRAY[..])` under the collection's ICU collation.

use crate::config::{Collation, Settings};
use crate::db::{DocumentStore, Filter, IndexKind, IndexRequest, SchemaAdmin};
use crate::error::DbError;
use crate::service::DocumentValidator;
use crate::store::{
    ensure_database_exists, ensure_sys_tables, load_collation, load_validator, qualified, quote_ident,
    quote_literal, replace_validator, upsert_collection_meta,
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tokio::sync::Mutex;

/// Connection pool plus the schema collections live in.
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
    schema: String,
}

impl PgDatabase {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        PgDatabase {
            pool,
            schema: schema.into(),
        }
    }

    /// Open: create the database if missing, build the pool and ensure `_sys_collections`.
    pub async fn connect(settings: &Settings) -> Result<Self, DbError> {
        ensure_database_exists(&settings.database_url).await?;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.database_url)
            .await?;
        ensure_sys_tables(&pool, &settings.schema).await?;
        Ok(PgDatabase::new(pool, settings.schema.clone()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Start a transactional session. Document operations on it are invisible to others until `commit`.
    pub async fn begin(&self) -> Result<PgSession, DbError> {
        let tx = self.pool.begin().await?;
        Ok(PgSession {
            tx: Mutex::new(Some(tx)),
            schema: self.schema.clone(),
        })
    }
}

/// A transaction usable as a `DocumentStore`. Dropping it without `commit` rolls back.
pub struct PgSession {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
    schema: String,
}

impl PgSession {
    pub async fn commit(&self) -> Result<(), DbError> {
        let tx = self.tx.lock().await.take().ok_or(DbError::SessionClosed)?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn abort(&self) -> Result<(), DbError> {
        let tx = self.tx.lock().await.take().ok_or(DbError::SessionClosed)?;
        tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDatabase {
    async fn insert_many(&self, collection: &str, docs: &[Value]) -> Result<u64, DbError> {
        let mut tx = self.pool.begin().await?;
        let n = insert_many(&mut tx, &self.schema, collection, docs).await?;
        tx.commit().await?;
        Ok(n)
    }

    async fn delete_all(&self, collection: &str) -> Result<u64, DbError> {
        let mut conn = self.pool.acquire().await?;
        delete_all(&mut conn, &self.schema, collection).await
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>, DbError> {
        let mut conn = self.pool.acquire().await?;
        find_one(&mut conn, &self.schema, collection, filter).await
    }

    async fn increment(
        &self,
        collection: &str,
        filter: &Filter,
        field: &str,
        amount: i64,
    ) -> Result<Option<Value>, DbError> {
        let mut conn = self.pool.acquire().await?;
        increment(&mut conn, &self.schema, collection, filter, field, amount).await
    }
}

#[async_trait]
impl DocumentStore for PgSession {
    async fn insert_many(&self, collection: &str, docs: &[Value]) -> Result<u64, DbError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(DbError::SessionClosed)?;
        insert_many(&mut **tx, &self.schema, collection, docs).await
    }

    async fn delete_all(&self, collection: &str) -> Result<u64, DbError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(DbError::SessionClosed)?;
        delete_all(&mut **tx, &self.schema, collection).await
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>, DbError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(DbError::SessionClosed)?;
        find_one(&mut **tx, &self.schema, collection, filter).await
    }

    async fn increment(
        &self,
        collection: &str,
        filter: &Filter,
        field: &str,
        amount: i64,
    ) -> Result<Option<Value>, DbError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(DbError::SessionClosed)?;
        increment(&mut **tx, &self.schema, collection, filter, field, amount).await
    }
}

#[async_trait]
impl SchemaAdmin for PgDatabase {
    async fn collection_exists(&self, name: &str) -> Result<bool, DbError> {
        let exists: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2)",
        )
        .bind(&self.schema)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists.0)
    }

    async fn create_collection(&self, name: &str, collation: &Collation) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;
        let collation_sql = format!(
            "CREATE COLLATION IF NOT EXISTS {} (provider = icu, locale = {}, deterministic = false)",
            qualified(&self.schema, &collation.object_name()),
            quote_literal(&collation.icu_locale())
        );
        tracing::debug!(sql = %collation_sql, "query");
        sqlx::query(&collation_sql).execute(&mut *tx).await?;
        let table_sql = format!(
            "CREATE TABLE {} (\n  id UUID PRIMARY KEY,\n  doc JSONB NOT NULL,\n  created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()\n)",
            qualified(&self.schema, name)
        );
        tracing::debug!(sql = %table_sql, "query");
        sqlx::query(&table_sql).execute(&mut *tx).await?;
        upsert_collection_meta(&mut tx, &self.schema, name, collation).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_validator(&self, name: &str, schema: &Value) -> Result<(), DbError> {
        if !self.collection_exists(name).await? {
            return Err(DbError::CollectionNotFound(name.to_string()));
        }
        let mut conn = self.pool.acquire().await?;
        replace_validator(&mut conn, &self.schema, name, schema).await
    }

    async fn validator(&self, name: &str) -> Result<Option<Value>, DbError> {
        let mut conn = self.pool.acquire().await?;
        load_validator(&mut conn, &self.schema, name).await
    }

    async fn create_index(&self, collection: &str, index: &IndexRequest) -> Result<bool, DbError> {
        let existing: Option<(String, String)> = sqlx::query_as(
            "SELECT tablename::text, indexdef FROM pg_indexes WHERE schemaname = $1 AND indexname = $2",
        )
        .bind(&self.schema)
        .bind(&index.name)
        .fetch_optional(&self.pool)
        .await?;
        if let Some((table, indexdef)) = existing {
            if table == collection && definition_matches(&indexdef, index) {
                return Ok(false);
            }
            return Err(DbError::IndexConflict {
                collection: collection.to_string(),
                index: index.name.clone(),
                existing: format!("index on {}: {}", table, indexdef),
            });
        }
        let mut conn = self.pool.acquire().await?;
        let collation = load_collation(&mut conn, &self.schema, collection).await?;
        if !index.options.extra.is_empty() {
            tracing::warn!(
                "index {} on {}: options {:?} have no PostgreSQL equivalent and are ignored",
                index.name,
                collection,
                index.options.extra.keys().collect::<Vec<_>>()
            );
        }
        let sql = create_index_sql(&self.schema, collection, collation.as_ref(), index)?;
        tracing::debug!(sql = %sql, "query");
        sqlx::query(&sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_write_error(e, collection))?;
        Ok(true)
    }

    async fn index_names(&self, collection: &str) -> Result<Vec<String>, DbError> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT indexname::text FROM pg_indexes WHERE schemaname = $1 AND tablename = $2 \
             AND indexname <> $3 ORDER BY indexname",
        )
        .bind(&self.schema)
        .bind(collection)
        .bind(format!("{}_pkey", collection))
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }
}

/// Text expression for a dotted field path.
fn field_expr(field: &str) -> String {
    let parts: Vec<String> = field.split('.').map(quote_literal).collect();
    format!("(doc #>> ARRAY[{}])", parts.join(", "))
}

fn create_index_sql(
    schema: &str,
    collection: &str,
    collation: Option<&Collation>,
    index: &IndexRequest,
) -> Result<String, DbError> {
    let collate = collation
        .map(|c| format!(" COLLATE {}", qualified(schema, &c.object_name())))
        .unwrap_or_default();
    let columns: Vec<String> = index
        .fields
        .iter()
        .map(|f| format!("({}{}) {}", field_expr(f.name()), collate, f.direction().as_sql()))
        .collect();
    let not_null: Vec<String> = index
        .fields
        .iter()
        .map(|f| format!("{} IS NOT NULL", field_expr(f.name())))
        .collect();

    let method = index.options.method.as_deref().unwrap_or("btree");
    if !method.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DbError::Validation {
            collection: collection.to_string(),
            message: format!("invalid index method '{}'", method),
        });
    }

    let mut predicates: Vec<String> = Vec::new();
    let unique = match index.kind {
        IndexKind::Plain => {
            if index.options.sparse {
                predicates.extend(not_null);
            }
            if let Some(w) = index.options.where_.as_deref() {
                predicates.push(format!("({})", w));
            }
            ""
        }
        IndexKind::Unique => "UNIQUE ",
        IndexKind::PartialUnique => {
            predicates.extend(not_null);
            "UNIQUE "
        }
    };
    let nulls = if index.kind == IndexKind::Unique {
        " NULLS NOT DISTINCT"
    } else {
        ""
    };
    let where_clause = if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    };

    Ok(format!(
        "CREATE {}INDEX {} ON {} USING {} ({}){}{}",
        unique,
        quote_ident(&index.name),
        qualified(schema, collection),
        method,
        columns.join(", "),
        nulls,
        where_clause
    ))
}

/// Whether an `indexdef` from `pg_indexes` has the request's uniqueness and covers its field paths.
fn definition_matches(indexdef: &str, index: &IndexRequest) -> bool {
    let unique = indexdef.starts_with("CREATE UNIQUE INDEX");
    let kind_matches = match index.kind {
        IndexKind::Plain => !unique,
        IndexKind::Unique => unique && indexdef.contains("NULLS NOT DISTINCT"),
        IndexKind::PartialUnique => unique && indexdef.contains(" WHERE "),
    };
    kind_matches
        && index
            .fields
            .iter()
            .flat_map(|f| f.name().split('.'))
            .all(|part| indexdef.contains(&quote_literal(part)))
}

/// Translate PostgreSQL error codes into the backend-neutral variants.
fn map_write_error(e: sqlx::Error, collection: &str) -> DbError {
    if let sqlx::Error::Database(db) = &e {
        match db.code().as_deref() {
            Some("23505") => {
                return DbError::DuplicateKey {
                    collection: collection.to_string(),
                    index: db.constraint().unwrap_or("unknown").to_string(),
                }
            }
            Some("42P01") => return DbError::CollectionNotFound(collection.to_string()),
            _ => {}
        }
    }
    DbError::Sqlx(e)
}

/// Appends `AND ...` predicates for `filter`, numbering parameters from `first_param`.
/// String values compare under the collection collation; other values compare as JSONB.
fn filter_sql(schema: &str, collation: Option<&Collation>, filter: &Filter, first_param: usize) -> String {
    let collate = collation
        .map(|c| format!(" COLLATE {}", qualified(schema, &c.object_name())))
        .unwrap_or_default();
    let mut sql = String::new();
    for (i, (_, value)) in filter.iter().enumerate() {
        let path = first_param + 2 * i;
        let val = path + 1;
        if value.is_string() {
            sql.push_str(&format!(" AND (doc #>> ${}::text[]){} = ${}::text", path, collate, val));
        } else {
            sql.push_str(&format!(" AND doc #> ${}::text[] = ${}::jsonb", path, val));
        }
    }
    sql
}

fn bind_filter<'q, O>(
    mut query: sqlx::query::QueryAs<'q, Postgres, O, sqlx::postgres::PgArguments>,
    filter: &'q Filter,
) -> sqlx::query::QueryAs<'q, Postgres, O, sqlx::postgres::PgArguments> {
    for (field, value) in filter {
        let path: Vec<String> = field.split('.').map(String::from).collect();
        query = query.bind(path);
        query = match value {
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(other),
        };
    }
    query
}

async fn insert_many(
    conn: &mut PgConnection,
    schema: &str,
    collection: &str,
    docs: &[Value],
) -> Result<u64, DbError> {
    let validator = load_validator(conn, schema, collection).await?;
    let sql = format!("INSERT INTO {} (id, doc) VALUES ($1, $2)", qualified(schema, collection));
    let mut count = 0u64;
    for doc in docs {
        if let Some(v) = &validator {
            DocumentValidator::validate(doc, v).map_err(|message| DbError::Validation {
                collection: collection.to_string(),
                message,
            })?;
        }
        let id = uuid::Uuid::new_v4();
        let mut doc = doc.clone();
        if let Value::Object(obj) = &mut doc {
            obj.entry("_id").or_insert_with(|| Value::String(id.to_string()));
        }
        tracing::debug!(sql = %sql, "query");
        sqlx::query(&sql)
            .bind(id)
            .bind(&doc)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_write_error(e, collection))?;
        count += 1;
    }
    Ok(count)
}

async fn delete_all(conn: &mut PgConnection, schema: &str, collection: &str) -> Result<u64, DbError> {
    let sql = format!("DELETE FROM {}", qualified(schema, collection));
    tracing::debug!(sql = %sql, "query");
    let result = sqlx::query(&sql)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_write_error(e, collection))?;
    Ok(result.rows_affected())
}

async fn find_one(
    conn: &mut PgConnection,
    schema: &str,
    collection: &str,
    filter: &Filter,
) -> Result<Option<Value>, DbError> {
    let collation = load_collation(conn, schema, collection).await?;
    let sql = format!(
        "SELECT doc FROM {} WHERE TRUE{} LIMIT 1",
        qualified(schema, collection),
        filter_sql(schema, collation.as_ref(), filter, 1)
    );
    tracing::debug!(sql = %sql, params = ?filter, "query");
    let query = bind_filter(sqlx::query_as::<_, (Value,)>(&sql), filter);
    let row = query
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_write_error(e, collection))?;
    Ok(row.map(|r| r.0))
}

/// Single UPDATE; the row lock taken by the sub-select serializes concurrent increments.
async fn increment(
    conn: &mut PgConnection,
    schema: &str,
    collection: &str,
    filter: &Filter,
    field: &str,
    amount: i64,
) -> Result<Option<Value>, DbError> {
    let collation = load_collation(conn, schema, collection).await?;
    let table = qualified(schema, collection);
    let sql = format!(
        "UPDATE {table} SET doc = jsonb_set(doc, ARRAY[$1::text], \
         to_jsonb(COALESCE((doc ->> $1::text)::bigint, 0) + $2::bigint)) \
         WHERE id = (SELECT id FROM {table} WHERE TRUE{filter} LIMIT 1 FOR UPDATE) \
         RETURNING doc",
        table = table,
        filter = filter_sql(schema, collation.as_ref(), filter, 3)
    );
    tracing::debug!(sql = %sql, field = %field, amount, params = ?filter, "query");
    let query = sqlx::query_as::<_, (Value,)>(&sql).bind(field).bind(amount);
    let row = bind_filter(query, filter)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            let bad_number = matches!(
                &e,
                sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("22P02") | Some("22003"))
            );
            if bad_number {
                DbError::NotANumber {
                    collection: collection.to_string(),
                    field: field.to_string(),
                }
            } else {
                map_write_error(e, collection)
            }
        })?;
    Ok(row.map(|r| r.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexDescriptor;
    use serde_json::json;

    #[test]
    fn unique_index_sql_treats_nulls_as_equal() {
        let req = IndexRequest::unique("counters", &["name".to_string()]);
        let sql = create_index_sql("public", "counters", Some(&Collation::default()), &req).unwrap();
        assert_eq!(
            sql,
            "CREATE UNIQUE INDEX \"counters_name_uniq\" ON \"public\".\"counters\" USING btree \
             (((doc #>> ARRAY['name']) COLLATE \"public\".\"en_level2\") ASC) NULLS NOT DISTINCT"
        );
    }

    #[test]
    fn partial_unique_sql_skips_nulls() {
        let req = IndexRequest::partial_unique("customers", &["tax_id".to_string(), "country".to_string()]);
        let sql = create_index_sql("public", "customers", None, &req).unwrap();
        assert!(sql.starts_with("CREATE UNIQUE INDEX \"customers_tax_id_country_uniq_partial\""));
        assert!(sql.ends_with(
            " WHERE (doc #>> ARRAY['tax_id']) IS NOT NULL AND (doc #>> ARRAY['country']) IS NOT NULL"
        ));
        assert!(!sql.contains("NULLS NOT DISTINCT"));
    }

    #[test]
    fn general_index_passes_options_through() {
        let idx: IndexDescriptor = serde_json::from_value(json!({
            "spec": [{ "name": "issued.at", "direction": -1 }],
            "options": { "method": "brin", "sparse": true, "where": "created_at > '2020-01-01'" }
        }))
        .unwrap();
        let req = IndexRequest::from_descriptor("invoices", &idx);
        let sql = create_index_sql("erp", "invoices", None, &req).unwrap();
        assert_eq!(
            sql,
            "CREATE INDEX \"invoices_issued_at_desc_idx\" ON \"erp\".\"invoices\" USING brin \
             (((doc #>> ARRAY['issued', 'at'])) DESC) \
             WHERE (doc #>> ARRAY['issued', 'at']) IS NOT NULL AND (created_at > '2020-01-01')"
        );
    }

    #[test]
    fn stored_definition_is_compared_not_just_the_name() {
        let nested = IndexRequest::unique("c", &["a.b".to_string()]);
        let flat = IndexRequest::unique("c", &["a_b".to_string()]);
        assert_eq!(nested.name, flat.name);
        let def = "CREATE UNIQUE INDEX c_a_b_uniq ON public.c USING btree \
                   (((doc #>> ARRAY['a'::text, 'b'::text])) COLLATE public.en_level2) NULLS NOT DISTINCT";
        assert!(definition_matches(def, &nested));
        assert!(!definition_matches(def, &flat));

        let partial = IndexRequest::partial_unique("c", &["a.b".to_string()]);
        assert!(!definition_matches(def, &partial));
        let plain = IndexRequest::from_descriptor("c", &IndexDescriptor::on(&["a.b"]));
        assert!(!definition_matches(def, &plain));
    }

    #[test]
    fn rejects_injected_method() {
        let mut idx = IndexDescriptor::on(&["a"]);
        idx.options.method = Some("btree; DROP TABLE x".into());
        let req = IndexRequest::from_descriptor("t", &idx);
        assert!(create_index_sql("public", "t", None, &req).is_err());
    }

    #[test]
    fn filter_numbers_parameters_in_pairs() {
        let filter = vec![
            ("name".to_string(), json!("sales")),
            ("active".to_string(), json!(true)),
        ];
        let sql = filter_sql("public", None, &filter, 3);
        assert_eq!(
            sql,
            " AND (doc #>> $3::text[]) = $4::text AND doc #> $5::text[] = $6::jsonb"
        );
    }

    async fn live_db() -> Option<PgDatabase> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let settings = Settings {
            database_url: url,
            schema: format!("provision_test_{}", uuid::Uuid::new_v4().simple()),
            ..Settings::default()
        };
        PgDatabase::connect(&settings).await.ok()
    }

    #[tokio::test]
    async fn live_partial_unique_allows_missing_fields() {
        let Some(db) = live_db().await else {
            return;
        };
        db.create_collection("customers", &Collation::default()).await.unwrap();
        db.create_partial_unique_index("customers", &["tax_id".to_string()])
            .await
            .unwrap();
        db.insert_many("customers", &[json!({ "name": "a" }), json!({ "name": "b" })])
            .await
            .unwrap();
        db.insert_many("customers", &[json!({ "tax_id": "X1" })]).await.unwrap();
        let err = db
            .insert_many("customers", &[json!({ "tax_id": "x1" })])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::DuplicateKey { .. }));
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", quote_ident(db.schema())))
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn live_concurrent_increments_are_not_lost() {
        let Some(db) = live_db().await else {
            return;
        };
        db.create_collection("counters", &Collation::default()).await.unwrap();
        db.insert_many("counters", &[json!({ "name": "sales", "seq": 0 })])
            .await
            .unwrap();
        let mut handles = Vec::new();
        for _ in 0..20 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.increment("counters", &[("name".to_string(), json!("sales"))], "seq", 1)
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let doc = db
            .find_one("counters", &[("name".to_string(), json!("SALES"))])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["seq"], json!(20));
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", quote_ident(db.schema())))
            .execute(db.pool())
            .await
            .unwrap();
    }
}
