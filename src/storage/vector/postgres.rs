//! PostgreSQL + pgvector vector database.
//!
//! One table per index, named `<table_prefix><index>` inside the configured
//! schema, with the columns
//!
//! | Column | Type |
//! |--------|------|
//! | `id` | `TEXT PRIMARY KEY` |
//! | `payload` | `JSONB` |
//! | `tags` | `JSONB` (`{"key": ["v1", "v2"]}`) |
//! | `embedding` | `vector(N)` |
//! | `timestamp` | `TIMESTAMP WITH TIME ZONE` |
//!
//! Similarity is `1 - (embedding <=> query)` (cosine). Tag filters compile to
//! JSONB containment (`tags @> '{"chatId": ["c1"]}'`), which is set
//! membership on multi-valued tags.
//!
//! Connections come from a `deadpool-postgres` pool. Every operation checks a
//! connection out and returns it when the operation's future (or stream)
//! completes or is dropped.

#[cfg(feature = "postgres")]
mod implementation {
    use crate::config::PostgresSettings;
    use crate::models::{
        Embedding, IndexName, MemoryFilter, MemoryRecord, Payload, ScoredRecord, TagCollection,
    };
    use crate::storage::migrations::{INDEX_MIGRATIONS, MigrationRunner, quote_identifier};
    use crate::storage::traits::{RecordStream, ScoredRecordStream, VectorDb};
    use crate::{Error, Result};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
    use futures::TryStreamExt;
    use regex::Regex;
    use secrecy::ExposeSecret;
    use std::sync::LazyLock;
    use tokio_postgres::error::SqlState;
    use tokio_postgres::types::ToSql;
    use tokio_postgres::{NoTls, Row};

    /// Postgres identifiers are truncated beyond this many bytes.
    const MAX_IDENTIFIER_LEN: usize = 63;

    /// `expected 3 dimensions, not 2` (insert into a `vector(3)` column).
    static EXPECTED_DIMS: LazyLock<Option<Regex>> =
        LazyLock::new(|| Regex::new(r"expected (\d+) dimensions, not (\d+)").ok());

    /// `different vector dimensions 3 and 2` (distance operator).
    static DIFFERENT_DIMS: LazyLock<Option<Regex>> =
        LazyLock::new(|| Regex::new(r"different vector dimensions (\d+) and (\d+)").ok());

    /// PostgreSQL + pgvector vector database.
    pub struct PostgresVectorDb {
        pool: Pool,
        schema: String,
        table_prefix: String,
    }

    type Param<'a> = &'a (dyn ToSql + Sync);

    fn pool_error(e: impl std::fmt::Display) -> Error {
        Error::connection("postgres_get_client", e)
    }

    fn parse_dimension_error(message: &str) -> Option<Error> {
        [&*EXPECTED_DIMS, &*DIFFERENT_DIMS]
            .into_iter()
            .flatten()
            .find_map(|re| re.captures(message))
            .and_then(|caps| {
                let expected = caps.get(1)?.as_str().parse().ok()?;
                let actual = caps.get(2)?.as_str().parse().ok()?;
                Some(Error::DimensionMismatch { expected, actual })
            })
    }

    /// Maps a driver error onto the storage error taxonomy.
    fn query_error(op: &str, index: &IndexName, e: &tokio_postgres::Error) -> Error {
        if let Some(db) = e.as_db_error() {
            if db.code() == &SqlState::UNDEFINED_TABLE {
                return Error::IndexNotFound {
                    index: index.to_string(),
                };
            }
            if let Some(mismatch) = parse_dimension_error(db.message()) {
                return mismatch;
            }
            return Error::operation(op, db.message());
        }
        let io_failure = std::error::Error::source(e)
            .is_some_and(|source| source.downcast_ref::<std::io::Error>().is_some());
        if e.is_closed() || io_failure {
            return Error::connection(op, e);
        }
        Error::operation(op, e)
    }

    fn decode_row(row: &Row, include_vector: bool) -> Result<MemoryRecord> {
        let id: String = row
            .try_get("id")
            .map_err(|e| Error::operation("postgres_decode_id", e))?;
        let payload: Option<serde_json::Value> = row
            .try_get("payload")
            .map_err(|e| Error::operation("postgres_decode_payload", e))?;
        let tags: Option<serde_json::Value> = row
            .try_get("tags")
            .map_err(|e| Error::operation("postgres_decode_tags", e))?;
        let timestamp: Option<DateTime<Utc>> = row
            .try_get("timestamp")
            .map_err(|e| Error::operation("postgres_decode_timestamp", e))?;

        let payload = match payload {
            Some(serde_json::Value::Object(map)) => map,
            Some(serde_json::Value::Null) | None => Payload::new(),
            Some(other) => {
                return Err(Error::operation(
                    "postgres_decode_payload",
                    format!("record '{id}' payload is not an object: {other}"),
                ));
            },
        };
        let tags: TagCollection = match tags {
            Some(serde_json::Value::Null) | None => TagCollection::new(),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| Error::operation("postgres_decode_tags", e))?,
        };

        let vector = if include_vector {
            let text: Option<String> = row
                .try_get("embedding")
                .map_err(|e| Error::operation("postgres_decode_embedding", e))?;
            text.as_deref().map(Embedding::from_pgvector_text).transpose()?
        } else {
            None
        };

        Ok(MemoryRecord {
            id,
            payload,
            tags,
            vector,
            timestamp,
        })
    }

    /// JSONB containment document for a filter: `{"k": ["v", ...]}`.
    fn containment(filter: &MemoryFilter) -> serde_json::Value {
        serde_json::Value::Object(
            filter
                .grouped()
                .into_iter()
                .map(|(k, values)| {
                    (
                        k.to_string(),
                        serde_json::Value::Array(
                            values
                                .into_iter()
                                .map(|v| serde_json::Value::String(v.to_string()))
                                .collect(),
                        ),
                    )
                })
                .collect(),
        )
    }

    fn limit_param(limit: Option<usize>) -> Option<i64> {
        limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX))
    }

    fn columns(include_vector: bool) -> &'static str {
        if include_vector {
            "id, payload, tags, timestamp, embedding::text AS embedding"
        } else {
            "id, payload, tags, timestamp"
        }
    }

    impl PostgresVectorDb {
        /// Connects using the configured settings.
        ///
        /// Installs the `vector` extension if the role is allowed to; otherwise
        /// the extension must already exist.
        ///
        /// # Errors
        ///
        /// Returns [`Error::Configuration`] if the connection string is missing
        /// or malformed, or [`Error::ConnectionFailure`] if the database is
        /// unreachable.
        pub async fn connect(settings: &PostgresSettings) -> Result<Self> {
            let url = settings.connection_string.as_ref().ok_or_else(|| {
                Error::Configuration("postgres.connection_string is not set".to_string())
            })?;
            let pg_config = Self::parse_connection_url(url.expose_secret())?;
            let manager = Manager::from_config(
                pg_config,
                NoTls,
                ManagerConfig {
                    recycling_method: RecyclingMethod::Fast,
                },
            );
            let pool = Pool::builder(manager)
                .max_size(settings.max_connections.max(1))
                .build()
                .map_err(|e| Error::Configuration(format!("postgres pool: {e}")))?;

            let db = Self::with_pool(pool, &settings.schema, &settings.table_prefix);
            db.ensure_extension().await?;
            Ok(db)
        }

        /// Wraps an existing pool.
        #[must_use]
        pub fn with_pool(
            pool: Pool,
            schema: impl Into<String>,
            table_prefix: impl Into<String>,
        ) -> Self {
            Self {
                pool,
                schema: schema.into(),
                table_prefix: table_prefix.into(),
            }
        }

        /// Parses the connection URL into a tokio-postgres config.
        fn parse_connection_url(url: &str) -> Result<tokio_postgres::Config> {
            url.parse::<tokio_postgres::Config>()
                .map_err(|e| Error::Configuration(format!("postgres connection string: {e}")))
        }

        async fn client(&self) -> Result<Object> {
            self.pool.get().await.map_err(pool_error)
        }

        async fn ensure_extension(&self) -> Result<()> {
            let client = self.client().await?;
            if let Err(e) = client
                .batch_execute("CREATE EXTENSION IF NOT EXISTS vector")
                .await
            {
                if e.as_db_error().is_none() {
                    return Err(Error::connection("postgres_connect", e));
                }
                tracing::warn!(error = %e, "Could not create the pgvector extension; assuming it is installed");
            }
            Ok(())
        }

        /// Physical (unquoted) table name of an index.
        fn table_name(&self, index: &IndexName) -> Result<String> {
            let table = format!("{}{}", self.table_prefix, index.as_str());
            if table.len() > MAX_IDENTIFIER_LEN {
                return Err(Error::InvalidInput(format!(
                    "table name '{table}' exceeds {MAX_IDENTIFIER_LEN} bytes"
                )));
            }
            Ok(table)
        }

        /// Quoted, schema-qualified table name of an index.
        fn full_table_name(&self, index: &IndexName) -> Result<String> {
            Ok(format!(
                "{}.{}",
                quote_identifier(&self.schema),
                quote_identifier(&self.table_name(index)?)
            ))
        }

        /// Returns true if the index table exists.
        ///
        /// # Errors
        ///
        /// Returns an error if the catalog query fails.
        pub async fn index_exists(&self, index: &IndexName) -> Result<bool> {
            let client = self.client().await?;
            self.table_exists(&client, index).await
        }

        async fn table_exists(&self, client: &Object, index: &IndexName) -> Result<bool> {
            let table = self.table_name(index)?;
            let row = client
                .query_one(
                    r"SELECT EXISTS (
                        SELECT FROM information_schema.tables
                        WHERE table_schema::text = $1
                          AND table_type::text = 'BASE TABLE'
                          AND table_name::text = $2
                    )",
                    &[&self.schema, &table],
                )
                .await
                .map_err(|e| query_error("postgres_table_exists", index, &e))?;
            Ok(row.get(0))
        }

        async fn ensure_table(&self, client: &Object, index: &IndexName) -> Result<()> {
            if self.table_exists(client, index).await? {
                Ok(())
            } else {
                Err(Error::IndexNotFound {
                    index: index.to_string(),
                })
            }
        }

        /// Dimensionality of an existing index table, if it exists.
        async fn existing_dimensions(
            &self,
            client: &Object,
            index: &IndexName,
        ) -> Result<Option<usize>> {
            let row = client
                .query_opt(
                    r"SELECT a.atttypmod
                      FROM pg_attribute a
                      WHERE a.attrelid = to_regclass($1)
                        AND a.attname = 'embedding'
                        AND NOT a.attisdropped",
                    &[&self.full_table_name(index)?],
                )
                .await
                .map_err(|e| query_error("postgres_index_dimensions", index, &e))?;
            Ok(row
                .map(|r| r.get::<_, i32>(0))
                .and_then(|typmod| usize::try_from(typmod).ok()))
        }

        /// Runs a row-producing query on a checked-out connection and streams
        /// the decoded rows. The connection stays checked out until the
        /// stream is exhausted or dropped.
        async fn stream_rows<T, F>(
            client: Object,
            index: &IndexName,
            operation: &'static str,
            sql: &str,
            params: &[Param<'_>],
            decode: F,
        ) -> Result<std::pin::Pin<Box<dyn futures::Stream<Item = Result<T>> + Send>>>
        where
            T: Send + 'static,
            F: Fn(&Row) -> Result<T> + Send + 'static,
        {
            let rows = client
                .query_raw(sql, params.iter().copied())
                .await
                .map_err(|e| query_error(operation, index, &e))?;
            let index = index.clone();

            Ok(Box::pin(async_stream::try_stream! {
                let _client = client;
                futures::pin_mut!(rows);
                while let Some(row) = rows
                    .try_next()
                    .await
                    .map_err(|e| query_error(operation, &index, &e))?
                {
                    yield decode(&row)?;
                }
            }))
        }
    }

    #[async_trait]
    impl VectorDb for PostgresVectorDb {
        fn backend_name(&self) -> &'static str {
            "postgres"
        }

        async fn create_index(&self, index: &IndexName, vector_size: usize) -> Result<()> {
            let table = self.table_name(index)?;
            {
                let client = self.client().await?;
                if let Some(existing) = self.existing_dimensions(&client, index).await? {
                    if existing != vector_size {
                        return Err(Error::DimensionMismatch {
                            expected: existing,
                            actual: vector_size,
                        });
                    }
                }
            }

            MigrationRunner::new(self.pool.clone(), &self.schema, table)
                .run(INDEX_MIGRATIONS, vector_size)
                .await
        }

        async fn list_indexes(&self) -> Result<Vec<String>> {
            let client = self.client().await?;
            let rows = client
                .query(
                    r"SELECT table_name::text
                      FROM information_schema.tables
                      WHERE table_schema::text = $1
                        AND table_type::text = 'BASE TABLE'
                        AND starts_with(table_name::text, $2::text)
                      ORDER BY table_name",
                    &[&self.schema, &self.table_prefix],
                )
                .await
                .map_err(|e| Error::operation("postgres_list_indexes", e))?;

            Ok(rows
                .iter()
                .filter_map(|row| {
                    let table: String = row.get(0);
                    table
                        .strip_prefix(self.table_prefix.as_str())
                        .map(ToString::to_string)
                })
                .collect())
        }

        async fn delete_index(&self, index: &IndexName) -> Result<()> {
            let table = self.table_name(index)?;
            let sql = format!("DROP TABLE IF EXISTS {}", self.full_table_name(index)?);
            {
                let client = self.client().await?;
                client
                    .batch_execute(&sql)
                    .await
                    .map_err(|e| query_error("postgres_delete_index", index, &e))?;
            }
            MigrationRunner::new(self.pool.clone(), &self.schema, table)
                .forget()
                .await
        }

        async fn upsert(&self, index: &IndexName, record: &MemoryRecord) -> Result<String> {
            let sql = format!(
                r"INSERT INTO {} (id, payload, tags, embedding, timestamp)
                  VALUES ($1, $2, $3, $4::text::vector, $5)
                  ON CONFLICT (id) DO UPDATE SET
                      payload = EXCLUDED.payload,
                      tags = EXCLUDED.tags,
                      embedding = EXCLUDED.embedding,
                      timestamp = EXCLUDED.timestamp",
                self.full_table_name(index)?
            );
            let payload = serde_json::Value::Object(record.payload.clone());
            let tags = serde_json::to_value(&record.tags)
                .map_err(|e| Error::operation("postgres_encode_tags", e))?;
            let embedding = record.vector.as_ref().map(Embedding::to_pgvector_text);

            let client = self.client().await?;
            client
                .execute(
                    &sql,
                    &[&record.id, &payload, &tags, &embedding, &record.timestamp],
                )
                .await
                .map_err(|e| query_error("postgres_upsert", index, &e))?;
            Ok(record.id.clone())
        }

        async fn read(
            &self,
            index: &IndexName,
            id: &str,
            include_vector: bool,
        ) -> Result<Option<MemoryRecord>> {
            let sql = format!(
                "SELECT {} FROM {} WHERE id = $1",
                columns(include_vector),
                self.full_table_name(index)?
            );
            let client = self.client().await?;
            let row = client
                .query_opt(&sql, &[&id])
                .await
                .map_err(|e| query_error("postgres_read", index, &e))?;
            row.map(|r| decode_row(&r, include_vector)).transpose()
        }

        async fn read_batch(
            &self,
            index: &IndexName,
            ids: &[String],
            include_vector: bool,
        ) -> Result<RecordStream> {
            let sql = format!(
                "SELECT {} FROM {} WHERE id = ANY($1)",
                columns(include_vector),
                self.full_table_name(index)?
            );
            let ids = ids.to_vec();
            let client = self.client().await?;
            Self::stream_rows(client, index, "postgres_read_batch", &sql, &[&ids], move |row| {
                decode_row(row, include_vector)
            })
            .await
        }

        async fn delete(&self, index: &IndexName, id: &str) -> Result<bool> {
            let sql = format!("DELETE FROM {} WHERE id = $1", self.full_table_name(index)?);
            let client = self.client().await?;
            let rows = client
                .execute(&sql, &[&id])
                .await
                .map_err(|e| query_error("postgres_delete", index, &e))?;
            Ok(rows > 0)
        }

        async fn delete_batch(&self, index: &IndexName, ids: &[String]) -> Result<u64> {
            let sql = format!(
                "DELETE FROM {} WHERE id = ANY($1)",
                self.full_table_name(index)?
            );
            let ids = ids.to_vec();
            let client = self.client().await?;
            client
                .execute(&sql, &[&ids])
                .await
                .map_err(|e| query_error("postgres_delete_batch", index, &e))
        }

        async fn list(
            &self,
            index: &IndexName,
            filter: &MemoryFilter,
            limit: Option<usize>,
            include_vector: bool,
        ) -> Result<RecordStream> {
            let tags = containment(filter);
            let limit = limit_param(limit);

            let mut params: Vec<Param<'_>> = Vec::new();
            let mut sql = format!(
                "SELECT {} FROM {}",
                columns(include_vector),
                self.full_table_name(index)?
            );
            if !filter.is_empty() {
                params.push(&tags);
                sql.push_str(&format!(" WHERE tags @> ${}", params.len()));
            }
            sql.push_str(" ORDER BY timestamp DESC NULLS LAST");
            if let Some(limit) = &limit {
                params.push(limit);
                sql.push_str(&format!(" LIMIT ${}", params.len()));
            }

            let client = self.client().await?;
            self.ensure_table(&client, index).await?;
            Self::stream_rows(client, index, "postgres_list", &sql, &params, move |row| {
                decode_row(row, include_vector)
            })
            .await
        }

        async fn search(
            &self,
            index: &IndexName,
            query: &Embedding,
            filter: &MemoryFilter,
            min_relevance: f64,
            limit: Option<usize>,
            include_vector: bool,
        ) -> Result<ScoredRecordStream> {
            let embedding = query.to_pgvector_text();
            let tags = containment(filter);
            let limit = limit_param(limit);

            let mut params: Vec<Param<'_>> = vec![&embedding, &min_relevance];
            let mut sql = format!(
                r"SELECT * FROM (
                    SELECT {}, 1 - (embedding <=> $1::text::vector) AS cosine_similarity
                    FROM {}
                    WHERE embedding IS NOT NULL",
                columns(include_vector),
                self.full_table_name(index)?
            );
            if !filter.is_empty() {
                params.push(&tags);
                sql.push_str(&format!(" AND tags @> ${}", params.len()));
            }
            sql.push_str(
                r") AS scored
                WHERE cosine_similarity >= $2
                ORDER BY cosine_similarity DESC",
            );
            if let Some(limit) = &limit {
                params.push(limit);
                sql.push_str(&format!(" LIMIT ${}", params.len()));
            }

            let client = self.client().await?;
            self.ensure_table(&client, index).await?;
            // pgvector only compares sizes against rows it scans.
            if let Some(dimensions) = self.existing_dimensions(&client, index).await? {
                query.ensure_dimensions(dimensions)?;
            }
            Self::stream_rows(client, index, "postgres_search", &sql, &params, move |row| {
                let score: f64 = row
                    .try_get("cosine_similarity")
                    .map_err(|e| Error::operation("postgres_decode_score", e))?;
                Ok(ScoredRecord {
                    record: decode_row(row, include_vector)?,
                    score,
                })
            })
            .await
        }
    }

    #[cfg(test)]
    #[allow(clippy::expect_used, clippy::unwrap_used)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_dimension_errors() {
            assert!(matches!(
                parse_dimension_error("expected 3 dimensions, not 2"),
                Some(Error::DimensionMismatch {
                    expected: 3,
                    actual: 2
                })
            ));
            assert!(matches!(
                parse_dimension_error("different vector dimensions 1536 and 384"),
                Some(Error::DimensionMismatch {
                    expected: 1536,
                    actual: 384
                })
            ));
            assert!(parse_dimension_error("syntax error at or near").is_none());
        }

        #[test]
        fn test_containment_groups_values() {
            let filter = MemoryFilter::new()
                .by_tag("chatId", "c1")
                .by_tag("user", "a")
                .by_tag("user", "b");
            assert_eq!(
                containment(&filter),
                serde_json::json!({"chatId": ["c1"], "user": ["a", "b"]})
            );
        }

        #[test]
        fn test_columns_projection() {
            assert!(!columns(false).contains("embedding"));
            assert!(columns(true).contains("embedding::text"));
        }

        #[test]
        fn test_limit_param() {
            assert_eq!(limit_param(None), None);
            assert_eq!(limit_param(Some(10)), Some(10));
        }
    }
}

#[cfg(feature = "postgres")]
pub use implementation::PostgresVectorDb;

#[cfg(not(feature = "postgres"))]
mod stub {
    use crate::config::PostgresSettings;
    use crate::models::{Embedding, IndexName, MemoryFilter, MemoryRecord};
    use crate::storage::traits::{RecordStream, ScoredRecordStream, VectorDb};
    use crate::{Error, Result};
    use async_trait::async_trait;

    fn disabled<T>() -> Result<T> {
        Err(Error::FeatureNotEnabled("postgres".to_string()))
    }

    /// PostgreSQL + pgvector vector database (stub when the feature is disabled).
    ///
    /// Cannot be constructed through [`connect`](Self::connect); every
    /// operation reports [`Error::FeatureNotEnabled`].
    pub struct PostgresVectorDb {
        _disabled: (),
    }

    impl PostgresVectorDb {
        /// Always fails: the `postgres` feature is not compiled in.
        ///
        /// # Errors
        ///
        /// Always returns [`Error::FeatureNotEnabled`].
        #[allow(clippy::unused_async)]
        pub async fn connect(_settings: &PostgresSettings) -> Result<Self> {
            disabled()
        }
    }

    #[async_trait]
    impl VectorDb for PostgresVectorDb {
        fn backend_name(&self) -> &'static str {
            "postgres"
        }

        async fn create_index(&self, _index: &IndexName, _vector_size: usize) -> Result<()> {
            disabled()
        }

        async fn list_indexes(&self) -> Result<Vec<String>> {
            disabled()
        }

        async fn delete_index(&self, _index: &IndexName) -> Result<()> {
            disabled()
        }

        async fn upsert(&self, _index: &IndexName, _record: &MemoryRecord) -> Result<String> {
            disabled()
        }

        async fn read(
            &self,
            _index: &IndexName,
            _id: &str,
            _include_vector: bool,
        ) -> Result<Option<MemoryRecord>> {
            disabled()
        }

        async fn read_batch(
            &self,
            _index: &IndexName,
            _ids: &[String],
            _include_vector: bool,
        ) -> Result<RecordStream> {
            disabled()
        }

        async fn delete(&self, _index: &IndexName, _id: &str) -> Result<bool> {
            disabled()
        }

        async fn delete_batch(&self, _index: &IndexName, _ids: &[String]) -> Result<u64> {
            disabled()
        }

        async fn list(
            &self,
            _index: &IndexName,
            _filter: &MemoryFilter,
            _limit: Option<usize>,
            _include_vector: bool,
        ) -> Result<RecordStream> {
            disabled()
        }

        async fn search(
            &self,
            _index: &IndexName,
            _query: &Embedding,
            _filter: &MemoryFilter,
            _min_relevance: f64,
            _limit: Option<usize>,
            _include_vector: bool,
        ) -> Result<ScoredRecordStream> {
            disabled()
        }
    }

    #[cfg(test)]
    #[allow(clippy::expect_used, clippy::unwrap_used)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_connect_reports_missing_feature() {
            let result = PostgresVectorDb::connect(&PostgresSettings::default()).await;
            assert!(matches!(result, Err(Error::FeatureNotEnabled(_))));
        }

        #[tokio::test]
        async fn test_operations_report_missing_feature() {
            let db = PostgresVectorDb { _disabled: () };
            let index = IndexName::parse("docs").expect("name");
            assert_eq!(db.backend_name(), "postgres");
            assert!(matches!(
                db.create_index(&index, 3).await,
                Err(Error::FeatureNotEnabled(_))
            ));
            assert!(matches!(
                db.list(&index, &MemoryFilter::new(), None, false).await.map(|_| ()),
                Err(Error::FeatureNotEnabled(_))
            ));
        }
    }
}

#[cfg(not(feature = "postgres"))]
pub use stub::PostgresVectorDb;
