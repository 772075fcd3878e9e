//! PostgreSQL migration system for index tables.
//!
//! Every index is one table. Its schema is built by an ordered list of
//! migrations, applied when the index is created and recorded in a shared
//! tracking table keyed by `(table_name, version)`. Re-running
//! `create_index` on an existing table applies only what is missing, so
//! tables created by older releases gain new indexes idempotently.
//!
//! No approximate (HNSW/IVFFlat) vector index is created. Search must return
//! every row above the relevance threshold, and an approximate scan stops at
//! its candidate list size.
//!
//! Migration SQL may use these placeholders:
//!
//! | Placeholder | Replaced with |
//! |-------------|---------------|
//! | `{table}` | quoted, schema-qualified table name |
//! | `{dimensions}` | vector dimensionality of the index |
//! | `{object}` | short stable token for naming dependent objects |
//!
//! # Usage
//!
//! ```rust,ignore
//! use vectormem::storage::migrations::{INDEX_MIGRATIONS, MigrationRunner};
//!
//! let runner = MigrationRunner::new(pool, "public", "km-docs");
//! runner.run(INDEX_MIGRATIONS, 1536).await?;
//! ```

/// A single migration with version and SQL.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Migration version (sequential, starting at 1).
    pub version: i32,
    /// Human-readable description.
    pub description: &'static str,
    /// SQL to apply (may contain multiple statements separated by semicolons).
    pub sql: &'static str,
}

/// Name of the shared migrations tracking table.
pub const MIGRATIONS_TABLE: &str = "vectormem_migrations";

/// Schema migrations applied to every index table.
///
/// The column layout of version 1 is the persisted contract: `id`, `payload`,
/// `tags`, `embedding`, `timestamp`.
pub const INDEX_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Create index table",
        sql: r"CREATE TABLE IF NOT EXISTS {table} (
                id TEXT NOT NULL,
                payload JSONB,
                tags JSONB,
                embedding vector({dimensions}),
                timestamp TIMESTAMP WITH TIME ZONE,
                PRIMARY KEY (id)
            )",
    },
    Migration {
        version: 2,
        description: "Add GIN index on tags",
        sql: r#"CREATE INDEX IF NOT EXISTS "vm_{object}_tags" ON {table} USING gin (tags jsonb_path_ops)"#,
    },
    Migration {
        version: 3,
        description: "Add timestamp index for recency listing",
        sql: r#"CREATE INDEX IF NOT EXISTS "vm_{object}_ts" ON {table} (timestamp DESC NULLS LAST)"#,
    },
];

/// Maximum version across a set of migrations.
#[must_use]
pub fn max_version(migrations: &[Migration]) -> i32 {
    migrations.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Quotes an identifier for interpolation into SQL.
#[must_use]
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Short stable token derived from `schema.table`, used to name indexes
/// without exceeding the 63-byte identifier limit.
#[must_use]
pub fn object_token(schema: &str, table: &str) -> String {
    let id = uuid::Uuid::new_v5(
        &uuid::Uuid::NAMESPACE_OID,
        format!("{schema}.{table}").as_bytes(),
    );
    id.simple().to_string()[..16].to_string()
}

/// Substitutes placeholders in migration SQL.
#[must_use]
pub fn render_sql(sql: &str, schema: &str, table: &str, dimensions: usize) -> String {
    let qualified = format!("{}.{}", quote_identifier(schema), quote_identifier(table));
    sql.replace("{table}", &qualified)
        .replace("{dimensions}", &dimensions.to_string())
        .replace("{object}", &object_token(schema, table))
}

#[cfg(feature = "postgres")]
mod implementation {
    use super::{MIGRATIONS_TABLE, Migration, quote_identifier, render_sql};
    use crate::{Error, Result};
    use deadpool_postgres::Pool;

    /// Runs migrations for one index table.
    pub struct MigrationRunner {
        pool: Pool,
        schema: String,
        table_name: String,
    }

    impl MigrationRunner {
        /// Creates a new migration runner.
        #[must_use]
        pub fn new(pool: Pool, schema: impl Into<String>, table_name: impl Into<String>) -> Self {
            Self {
                pool,
                schema: schema.into(),
                table_name: table_name.into(),
            }
        }

        /// Returns the table name.
        #[must_use]
        pub fn table_name(&self) -> &str {
            &self.table_name
        }

        fn tracking_table(&self) -> String {
            format!(
                "{}.{}",
                quote_identifier(&self.schema),
                quote_identifier(MIGRATIONS_TABLE)
            )
        }

        async fn connection(&self) -> Result<deadpool_postgres::Object> {
            self.pool
                .get()
                .await
                .map_err(|e| Error::connection("migration_get_connection", e))
        }

        /// Runs all pending migrations.
        ///
        /// # Errors
        ///
        /// Returns an error if a migration fails.
        pub async fn run(&self, migrations: &[Migration], dimensions: usize) -> Result<()> {
            let mut client = self.connection().await?;

            self.ensure_migrations_table(&client).await?;
            let current_version = self.get_current_version(&client).await?;

            for migration in migrations {
                if migration.version > current_version {
                    self.apply_migration(&mut client, migration, dimensions)
                        .await?;
                }
            }

            Ok(())
        }

        /// Returns the current schema version of the table (0 if never migrated).
        ///
        /// # Errors
        ///
        /// Returns an error if the database cannot be queried.
        pub async fn current_version(&self) -> Result<i32> {
            let client = self.connection().await?;
            self.ensure_migrations_table(&client).await?;
            self.get_current_version(&client).await
        }

        /// Removes the table's migration history (after the table is dropped).
        ///
        /// # Errors
        ///
        /// Returns an error if the delete fails.
        pub async fn forget(&self) -> Result<()> {
            let client = self.connection().await?;
            self.ensure_migrations_table(&client).await?;
            let sql = format!("DELETE FROM {} WHERE table_name = $1", self.tracking_table());
            client
                .execute(&sql, &[&self.table_name])
                .await
                .map_err(|e| Error::operation("forget_migrations", e))?;
            Ok(())
        }

        async fn ensure_migrations_table(&self, client: &deadpool_postgres::Object) -> Result<()> {
            let sql = format!(
                r"
                CREATE TABLE IF NOT EXISTS {} (
                    table_name TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    description TEXT NOT NULL,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (table_name, version)
                )
                ",
                self.tracking_table()
            );

            client
                .batch_execute(&sql)
                .await
                .map_err(|e| Error::operation("create_migrations_table", e))
        }

        async fn get_current_version(&self, client: &deadpool_postgres::Object) -> Result<i32> {
            let sql = format!(
                "SELECT COALESCE(MAX(version), 0) FROM {} WHERE table_name = $1",
                self.tracking_table()
            );

            let row = client
                .query_one(&sql, &[&self.table_name])
                .await
                .map_err(|e| Error::operation("get_migration_version", e))?;
            Ok(row.get(0))
        }

        /// Applies a single migration within a transaction.
        ///
        /// All statements and the version record commit together or not at
        /// all. The record insert tolerates a concurrent runner having applied
        /// the same version first.
        async fn apply_migration(
            &self,
            client: &mut deadpool_postgres::Object,
            migration: &Migration,
            dimensions: usize,
        ) -> Result<()> {
            let sql = render_sql(migration.sql, &self.schema, &self.table_name, dimensions);

            let tx = client.transaction().await.map_err(|e| {
                Error::operation(format!("migration_v{}_begin_tx", migration.version), e)
            })?;

            for statement in sql.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }

                tx.execute(statement, &[]).await.map_err(|e| {
                    Error::operation(
                        format!("migration_v{}: {}", migration.version, migration.description),
                        e,
                    )
                })?;
            }

            let record_sql = format!(
                "INSERT INTO {} (table_name, version, description) VALUES ($1, $2, $3)
                 ON CONFLICT (table_name, version) DO NOTHING",
                self.tracking_table()
            );
            tx.execute(
                &record_sql,
                &[&self.table_name, &migration.version, &migration.description],
            )
            .await
            .map_err(|e| Error::operation("record_migration", e))?;

            tx.commit().await.map_err(|e| {
                Error::operation(format!("migration_v{}_commit", migration.version), e)
            })?;

            tracing::info!(
                version = migration.version,
                description = migration.description,
                table = self.table_name,
                "Applied migration"
            );

            Ok(())
        }
    }
}

#[cfg(feature = "postgres")]
pub use implementation::MigrationRunner;

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_sequential() {
        for (i, m) in INDEX_MIGRATIONS.iter().enumerate() {
            assert_eq!(m.version, i32::try_from(i + 1).expect("small"));
        }
        assert_eq!(max_version(INDEX_MIGRATIONS), 3);
        assert_eq!(max_version(&[]), 0);
    }

    #[test]
    fn test_render_sql_substitutes_placeholders() {
        let sql = render_sql(INDEX_MIGRATIONS[0].sql, "public", "km-docs", 1536);
        assert!(sql.contains(r#""public"."km-docs""#));
        assert!(sql.contains("vector(1536)"));
        assert!(!sql.contains('{'));

        let sql = render_sql(INDEX_MIGRATIONS[1].sql, "public", "km-docs", 3);
        let token = object_token("public", "km-docs");
        assert!(sql.contains(&format!("\"vm_{token}_tags\"")));
    }

    #[test]
    fn test_object_token_is_stable_and_short() {
        let a = object_token("public", "km-docs");
        assert_eq!(a, object_token("public", "km-docs"));
        assert_ne!(a, object_token("public", "km-other"));
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_quote_identifier_escapes_quotes() {
        assert_eq!(quote_identifier("km-docs"), "\"km-docs\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }
}
