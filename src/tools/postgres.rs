// PostgreSQL collaborators: pg_dump/psql for dumps and restores, sqlx for
// ephemeral database administration and integrity checks.

use super::{ApplyMode, DatabaseAdmin, DumpScope, DumpTool, RestorePlan};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

/// Schema holding one tenant's tables
pub fn tenant_schema(tenant_id: Uuid) -> String {
    format!("tenant_{}", tenant_id.simple())
}

/// Dumps with `pg_dump` (plain SQL, INSERT statements) and restores with `psql`
#[derive(Debug, Clone)]
pub struct PgDumpTool {
    pg_dump_bin: String,
    psql_bin: String,
    configuration_tables: Vec<String>,
}

impl PgDumpTool {
    pub fn new(pg_dump_bin: impl Into<String>, psql_bin: impl Into<String>) -> Self {
        Self {
            pg_dump_bin: pg_dump_bin.into(),
            psql_bin: psql_bin.into(),
            configuration_tables: vec![
                "public.platform_settings".to_string(),
                "public.feature_flags".to_string(),
            ],
        }
    }

    /// Tables included in CONFIGURATION dumps
    pub fn with_configuration_tables(mut self, tables: Vec<String>) -> Self {
        self.configuration_tables = tables;
        self
    }

    async fn psql_command(&self, connection: &str, sql: &str) -> Result<Output> {
        let output = Command::new(&self.psql_bin)
            .arg("--dbname")
            .arg(connection)
            .arg("--no-psqlrc")
            .arg("-v")
            .arg("ON_ERROR_STOP=1")
            .arg("-c")
            .arg(sql)
            .output()
            .await
            .with_context(|| format!("failed to start {}", self.psql_bin))?;
        check_status(&self.psql_bin, &output)?;
        Ok(output)
    }

    /// Clear what a REPLACE restore is about to overwrite: exactly the
    /// objects the dump recreates
    async fn clear_target(&self, connection: &str, plan: &RestorePlan) -> Result<()> {
        for statement in clear_statements(plan, &self.configuration_tables)? {
            self.psql_command(connection, &statement).await?;
        }
        Ok(())
    }
}

fn clear_statements(plan: &RestorePlan, configuration_tables: &[String]) -> Result<Vec<String>> {
    match plan.scope {
        DumpScope::Full => Ok(vec![DROP_USER_SCHEMAS.to_string()]),
        DumpScope::Tenant(owner) => {
            if let Some(stranger) = plan
                .tenant_ids
                .iter()
                .flatten()
                .find(|tenant| **tenant != owner)
            {
                bail!(
                    "dump of tenant {} cannot replace tenant {}",
                    owner,
                    stranger
                );
            }
            Ok(vec![format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                quote_ident(&tenant_schema(owner))
            )])
        }
        DumpScope::Configuration => Ok(configuration_tables
            .iter()
            .map(|table| format!("DROP TABLE IF EXISTS {} CASCADE", quote_qualified(table)))
            .collect()),
    }
}

/// Quote `schema.table` part by part
fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

const DROP_USER_SCHEMAS: &str = "DO $$ DECLARE s record; BEGIN \
     FOR s IN SELECT nspname FROM pg_namespace \
     WHERE nspname NOT LIKE 'pg\\_%' AND nspname <> 'information_schema' LOOP \
     EXECUTE format('DROP SCHEMA %I CASCADE', s.nspname); END LOOP; \
     CREATE SCHEMA IF NOT EXISTS public; END $$;";

fn check_status(program: &str, output: &Output) -> Result<()> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} exited with {}: {}", program, output.status, stderr.trim());
    }
    Ok(())
}

/// Sum the row counts of `INSERT 0 n` command tags
fn count_inserted_rows(stdout: &str) -> u64 {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("INSERT 0 "))
        .filter_map(|n| n.trim().parse::<u64>().ok())
        .sum()
}

#[async_trait]
impl DumpTool for PgDumpTool {
    async fn dump(&self, output: &Path, connection: &str, scope: DumpScope) -> Result<()> {
        let mut command = Command::new(&self.pg_dump_bin);
        command
            .arg("--dbname")
            .arg(connection)
            .arg("--format=plain")
            .arg("--no-owner")
            .arg("--inserts")
            .arg("--on-conflict-do-nothing")
            .arg("--file")
            .arg(output);

        match scope {
            DumpScope::Full => {}
            DumpScope::Tenant(tenant_id) => {
                command.arg("--schema").arg(tenant_schema(tenant_id));
            }
            DumpScope::Configuration => {
                for table in &self.configuration_tables {
                    command.arg("--table").arg(table);
                }
            }
        }

        debug!(scope = ?scope, output = %output.display(), "Running pg_dump");
        let result = command
            .output()
            .await
            .with_context(|| format!("failed to start {}", self.pg_dump_bin))?;
        check_status(&self.pg_dump_bin, &result)
    }

    async fn apply_restore(&self, input: &Path, connection: &str, plan: &RestorePlan) -> Result<u64> {
        if plan.apply == ApplyMode::Replace {
            self.clear_target(connection, plan).await?;
        }

        let mut command = Command::new(&self.psql_bin);
        command
            .arg("--dbname")
            .arg(connection)
            .arg("--no-psqlrc")
            .arg("--file")
            .arg(input);
        // MERGE keeps going past "already exists" errors; existing rows win
        // through ON CONFLICT DO NOTHING in the dump.
        if plan.apply == ApplyMode::Replace {
            command.arg("-v").arg("ON_ERROR_STOP=1");
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("failed to start {}", self.psql_bin))?;
        check_status(&self.psql_bin, &output)?;

        let rows = count_inserted_rows(&String::from_utf8_lossy(&output.stdout));
        info!(mode = ?plan.apply, rows_restored = rows, "Dump applied");
        Ok(rows)
    }
}

/// sqlx-backed database administration
#[derive(Clone)]
pub struct PgAdmin {
    admin_pool: PgPool,
    admin_url: String,
}

impl PgAdmin {
    /// `admin_url` points at a maintenance database (usually `postgres`)
    pub async fn connect(admin_url: &str) -> Result<Self> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(admin_url)
            .await
            .context("failed to connect to the maintenance database")?;
        Ok(Self {
            admin_pool,
            admin_url: admin_url.to_string(),
        })
    }

    async fn inspection_pool(connection: &str) -> Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(connection)
            .await
            .context("failed to connect to the inspected database")
    }
}

/// Replace the database segment of a connection URL
pub fn with_database(url: &str, database: &str) -> String {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };
    let authority_end = base.find("://").map(|i| i + 3).unwrap_or(0);
    let prefix = match base[authority_end..].find('/') {
        Some(slash) => &base[..authority_end + slash],
        None => base,
    };
    match query {
        Some(query) => format!("{}/{}?{}", prefix, database, query),
        None => format!("{}/{}", prefix, database),
    }
}

fn validate_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(anyhow!("invalid database name: {}", name));
    }
    Ok(())
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[async_trait]
impl DatabaseAdmin for PgAdmin {
    async fn create_database(&self, name: &str) -> Result<String> {
        validate_identifier(name)?;
        sqlx::query(&format!("CREATE DATABASE {}", quote_ident(name)))
            .execute(&self.admin_pool)
            .await
            .with_context(|| format!("failed to create database {}", name))?;
        Ok(with_database(&self.admin_url, name))
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        validate_identifier(name)?;
        sqlx::query(&format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", quote_ident(name)))
            .execute(&self.admin_pool)
            .await
            .with_context(|| format!("failed to drop database {}", name))?;
        Ok(())
    }

    async fn list_tables(&self, connection: &str) -> Result<Vec<String>> {
        let pool = Self::inspection_pool(connection).await?;
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT (table_schema || '.' || table_name)::text FROM information_schema.tables \
             WHERE table_type = 'BASE TABLE' \
             AND table_schema NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY 1",
        )
        .fetch_all(&pool)
        .await?;
        pool.close().await;
        Ok(tables)
    }

    async fn row_counts(&self, connection: &str) -> Result<Vec<(String, i64)>> {
        let pool = Self::inspection_pool(connection).await?;
        let tables: Vec<(String, String)> = sqlx::query_as(
            "SELECT table_schema::text, table_name::text FROM information_schema.tables \
             WHERE table_type = 'BASE TABLE' \
             AND table_schema NOT IN ('pg_catalog', 'information_schema')",
        )
        .fetch_all(&pool)
        .await?;

        let mut counts = Vec::with_capacity(tables.len());
        for (schema, table) in tables {
            let sql = format!("SELECT count(*) FROM {}.{}", quote_ident(&schema), quote_ident(&table));
            let count: i64 = sqlx::query_scalar(&sql).fetch_one(&pool).await?;
            counts.push((format!("{}.{}", schema, table), count));
        }
        pool.close().await;
        Ok(counts)
    }

    async fn orphaned_references(&self, connection: &str) -> Result<Vec<String>> {
        let pool = Self::inspection_pool(connection).await?;
        let foreign_keys: Vec<(String, String, String, String, String, String, String)> = sqlx::query_as(
            "SELECT tc.constraint_name::text, tc.table_schema::text, tc.table_name::text, \
                    kcu.column_name::text, ccu.table_schema::text, ccu.table_name::text, \
                    ccu.column_name::text \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
             JOIN information_schema.constraint_column_usage ccu \
               ON ccu.constraint_name = tc.constraint_name AND ccu.constraint_schema = tc.table_schema \
             WHERE tc.constraint_type = 'FOREIGN KEY'",
        )
        .fetch_all(&pool)
        .await?;

        let mut orphans = Vec::new();
        for (constraint, schema, table, column, ref_schema, ref_table, ref_column) in foreign_keys {
            let sql = format!(
                "SELECT count(*) FROM {}.{} c LEFT JOIN {}.{} p ON c.{} = p.{} \
                 WHERE c.{} IS NOT NULL AND p.{} IS NULL",
                quote_ident(&schema),
                quote_ident(&table),
                quote_ident(&ref_schema),
                quote_ident(&ref_table),
                quote_ident(&column),
                quote_ident(&ref_column),
                quote_ident(&column),
                quote_ident(&ref_column),
            );
            let dangling: i64 = sqlx::query_scalar(&sql).fetch_one(&pool).await?;
            if dangling > 0 {
                orphans.push(format!(
                    "{}: {} rows in {}.{} reference missing {}.{}",
                    constraint, dangling, schema, table, ref_schema, ref_table
                ));
            }
        }
        pool.close().await;
        Ok(orphans)
    }

    async fn structural_problems(&self, connection: &str) -> Result<Vec<String>> {
        let pool = Self::inspection_pool(connection).await?;
        let invalid: Vec<String> =
            sqlx::query_scalar("SELECT indexrelid::regclass::text FROM pg_index WHERE NOT indisvalid OR NOT indisready")
                .fetch_all(&pool)
                .await?;
        pool.close().await;
        Ok(invalid
            .into_iter()
            .map(|index| format!("invalid index {}", index))
            .collect())
    }
}
