//! SurrealDB schema migrations and initialization
//!
//! Sets up the backup tables with their indexes. Every statement uses
//! `IF NOT EXISTS`, so calling `init_schema` on every connect is safe.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all recvault tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing recvault SurrealDB schema");

    init_jobs_table(db).await?;
    init_artifacts_table(db).await?;
    init_locks_table(db).await?;

    info!("recvault schema initialization complete");
    Ok(())
}

/// Initialize `backup_jobs` table
///
/// Schema:
/// ```text
/// TABLE backup_jobs {
///   job_id:           STRING (unique)
///   backup_kind:      STRING (database | media | full)
///   quick:            BOOL
///   status:           STRING (in_progress | success | failed)
///   started_at:       DATETIME (indexed)
///   completed_at:     DATETIME?
///   duration_seconds: FLOAT?
///   byte_size:        INT?
///   checksum:         STRING?
///   artifact_id:      STRING? (indexed)
///   error_message:    STRING?
///   metadata:         ARRAY (schemaless tagged entries)
/// }
/// ```
///
/// `status` transitions in_progress → success | failed are enforced by the
/// store, not by the database.
async fn init_jobs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing backup_jobs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS backup_jobs SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_job_id ON TABLE backup_jobs COLUMNS job_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_job_kind_status ON TABLE backup_jobs COLUMNS backup_kind, status;
        DEFINE INDEX IF NOT EXISTS idx_job_started_at ON TABLE backup_jobs COLUMNS started_at;
        DEFINE INDEX IF NOT EXISTS idx_job_artifact ON TABLE backup_jobs COLUMNS artifact_id;
    "#;

    db.query(sql).await?.check()?;
    debug!("backup_jobs table initialized");
    Ok(())
}

/// Initialize `backup_artifacts` table
///
/// Rows are insert-only for record users; `artifact_id` is unique. The
/// store itself deletes a row only to withdraw a registration whose job
/// never landed.
async fn init_artifacts_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing backup_artifacts table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS backup_artifacts SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_artifact_id ON TABLE backup_artifacts COLUMNS artifact_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_artifact_kind ON TABLE backup_artifacts COLUMNS backup_kind;
        DEFINE INDEX IF NOT EXISTS idx_artifact_created_at ON TABLE backup_artifacts COLUMNS created_at;
    "#;

    db.query(sql).await?.check()?;
    debug!("backup_artifacts table initialized");
    Ok(())
}

/// Initialize `backup_locks` table
///
/// One record per backup kind (`backup_locks:database`, …) while a job of
/// that kind is in progress. Record ids are unique, so `CREATE` doubles as
/// the compare-and-set.
async fn init_locks_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing backup_locks table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS backup_locks SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_lock_job ON TABLE backup_locks COLUMNS job_id;
    "#;

    db.query(sql).await?.check()?;
    debug!("backup_locks table initialized");
    Ok(())
}
