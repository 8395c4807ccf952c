// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! armfarm-oracle
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The database oracle: the only task in the whole master that is allowed
//! to touch the Postgres connection. Every other task reaches it through
//! an [`OracleRequest`]/[`OracleReply`] exchange (normally routed through
//! Seraph's fair queue, never dialed directly), which keeps every write
//! serialized behind [`Oracle::run`]'s single consuming loop even though
//! the pool itself could support concurrent connections.
//!
//! `NEWPKG`/`NEWVER`/`LOGBUILD` are written as idempotent upserts: a
//! retried message (after a crash between commit and reply, for example)
//! must never be visible as two rows.

use armfarm_core::{BuildStatus, BuildTarget, BuiltFile, FileRecord, Package, PypiSerial, Version};
use armfarm_error::ErrorCode;
use armfarm_protocol::{OracleReply, OracleRequest, OracleValue};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Errors arising from the oracle's SQL layer.
#[derive(Debug, Error)]
pub enum OracleError {
    /// A SQL statement failed.
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// A query expected to return a row returned none (e.g. `LASTBUILT`
    /// with no builds recorded yet).
    #[error("no rows: {0}")]
    NotFound(&'static str),
}

impl OracleError {
    /// The [`ErrorCode`] this error maps onto.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Query(_) => ErrorCode::StorageQueryFailed,
            Self::NotFound(_) => ErrorCode::StorageQueryFailed,
        }
    }
}

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

/// A connected handle to the armfarm database.
///
/// Cloning an `Oracle` clones the underlying [`PgPool`], which is itself
/// cheap and safe to share — but only [`Oracle::run`]'s single task should
/// ever call the write-performing methods, so that writes stay serialized.
#[derive(Debug, Clone)]
pub struct Oracle {
    pool: PgPool,
}

impl Oracle {
    /// Connect to `dsn`, sizing the pool for a single-writer workload.
    ///
    /// # Errors
    ///
    /// Returns [`OracleError::Query`] if the connection cannot be established.
    pub async fn connect(dsn: &str) -> Result<Self, OracleError> {
        let pool = PgPoolOptions::new().max_connections(4).connect(dsn).await?;
        Ok(Self { pool })
    }

    /// Wrap an already-constructed pool (used by tests with a pool pointed
    /// at a throwaway schema).
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    // -- Packages and versions ----------------------------------------------

    /// Every known package, including skipped ones.
    async fn all_pkgs(&self) -> Result<Vec<Package>, OracleError> {
        let rows = sqlx::query("SELECT name, skip FROM packages ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| Package {
                name: r.get("name"),
                skip: r.get("skip"),
            })
            .collect())
    }

    /// Every known version of every package.
    async fn all_vers(&self) -> Result<Vec<Version>, OracleError> {
        let rows = sqlx::query("SELECT package, version, skip FROM versions ORDER BY package, version")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| Version {
                package: r.get("package"),
                version: r.get("version"),
                skip: r.get("skip"),
            })
            .collect())
    }

    /// Record a newly discovered package. Idempotent: a package that
    /// already exists is left untouched.
    async fn new_pkg(&self, package: &str) -> Result<(), OracleError> {
        sqlx::query("INSERT INTO packages (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(package)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a newly discovered version. Idempotent.
    async fn new_ver(&self, package: &str, version: &str) -> Result<(), OracleError> {
        sqlx::query(
            "INSERT INTO versions (package, version) VALUES ($1, $2) \
             ON CONFLICT (package, version) DO NOTHING",
        )
        .bind(package)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a package as permanently skipped.
    async fn skip_pkg(&self, package: &str, reason: &str) -> Result<(), OracleError> {
        sqlx::query("UPDATE packages SET skip = TRUE, skip_reason = $2 WHERE name = $1")
            .bind(package)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark one version as permanently skipped.
    async fn skip_ver(&self, package: &str, version: &str, reason: &str) -> Result<(), OracleError> {
        sqlx::query(
            "UPDATE versions SET skip = TRUE, skip_reason = $3 WHERE package = $1 AND version = $2",
        )
        .bind(package)
        .bind(version)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether a package is already known.
    async fn pkg_exists(&self, package: &str) -> Result<bool, OracleError> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM packages WHERE name = $1) AS exists")
            .bind(package)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("exists"))
    }

    // -- Downloads and builds -------------------------------------------------

    /// Record a file download.
    async fn log_download(&self, filename: &str, host_family: &str) -> Result<(), OracleError> {
        sqlx::query("INSERT INTO downloads (filename, host_family) VALUES ($1, $2)")
            .bind(filename)
            .bind(host_family)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the outcome of a build, plus any files it produced, as a
    /// single transaction.
    ///
    /// A new success supersedes the (package, version)'s prior successful
    /// build, if any: that build's files and row are deleted first so that
    /// invariant (1) (at most one successful build per (package, version))
    /// always holds.
    async fn log_build(
        &self,
        package: &str,
        version: &str,
        status: BuildStatus,
        duration: f64,
        output: &str,
        built_by: u64,
        files: &[BuiltFile],
    ) -> Result<i64, OracleError> {
        let mut tx = self.pool.begin().await?;

        if status.is_success() {
            let prior = sqlx::query(
                "SELECT build_id FROM builds WHERE package = $1 AND version = $2 AND status",
            )
            .bind(package)
            .bind(version)
            .fetch_all(&mut *tx)
            .await?;
            for row in prior {
                let prior_id: i64 = row.get("build_id");
                sqlx::query("DELETE FROM files WHERE build_id = $1")
                    .bind(prior_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM builds WHERE build_id = $1")
                    .bind(prior_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let row = sqlx::query(
            "INSERT INTO builds (package, version, status, build_time, output, built_by) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING build_id",
        )
        .bind(package)
        .bind(version)
        .bind(status.is_success())
        .bind(duration)
        .bind(output)
        .bind(built_by as i64)
        .fetch_one(&mut *tx)
        .await?;
        let build_id: i64 = row.get("build_id");

        for file in files {
            sqlx::query(
                "INSERT INTO files \
                 (filename, build_id, filesize, filehash, package_version_tag, py_version_tag, abi_tag, platform_tag) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(&file.filename)
            .bind(build_id)
            .bind(file.filesize)
            .bind(&file.filehash)
            .bind(&file.package_version_tag)
            .bind(&file.py_version_tag)
            .bind(&file.abi_tag)
            .bind(&file.platform_tag)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(build_id)
    }

    /// Delete a previously recorded build and its files.
    async fn del_build(&self, build_id: i64) -> Result<(), OracleError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM files WHERE build_id = $1")
            .bind(build_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM builds WHERE build_id = $1")
            .bind(build_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Every file belonging to a package.
    async fn pkg_files(&self, package: &str) -> Result<Vec<FileRecord>, OracleError> {
        let rows = sqlx::query(
            "SELECT f.filename, f.build_id, f.filesize, f.filehash, \
                    f.package_version_tag, f.py_version_tag, f.abi_tag, f.platform_tag \
             FROM files f JOIN builds b ON b.build_id = f.build_id \
             WHERE b.package = $1 ORDER BY f.filename",
        )
        .bind(package)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(file_record_from_row).collect())
    }

    /// Every file belonging to one version of a package.
    async fn ver_files(&self, package: &str, version: &str) -> Result<Vec<FileRecord>, OracleError> {
        let rows = sqlx::query(
            "SELECT f.filename, f.build_id, f.filesize, f.filehash, \
                    f.package_version_tag, f.py_version_tag, f.abi_tag, f.platform_tag \
             FROM files f JOIN builds b ON b.build_id = f.build_id \
             WHERE b.package = $1 AND b.version = $2 ORDER BY f.filename",
        )
        .bind(package)
        .bind(version)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(file_record_from_row).collect())
    }

    /// Every distinct ABI tag ever built.
    async fn get_abis(&self) -> Result<Vec<String>, OracleError> {
        let rows = sqlx::query("SELECT DISTINCT abi_tag FROM files ORDER BY abi_tag")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("abi_tag")).collect())
    }

    /// (package, version) pairs with no successful build, where neither the
    /// package nor the version carries a skip flag.
    async fn buildable_targets(&self) -> Result<Vec<BuildTarget>, OracleError> {
        let rows = sqlx::query(
            "SELECT v.package, v.version FROM versions v \
             JOIN packages p ON p.name = v.package \
             WHERE NOT p.skip AND NOT v.skip \
               AND NOT EXISTS ( \
                 SELECT 1 FROM builds b \
                 WHERE b.package = v.package AND b.version = v.version AND b.status \
               ) \
             ORDER BY v.package, v.version",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| BuildTarget {
                package: r.get("package"),
                version: r.get("version"),
            })
            .collect())
    }

    // -- Metadata key/value store ---------------------------------------------

    /// Current PyPI `serial` watermark.
    async fn get_pypi(&self) -> Result<PypiSerial, OracleError> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = 'pypi_serial'")
            .fetch_optional(&self.pool)
            .await?
            .ok_or(OracleError::NotFound("pypi_serial"))?;
        let value: String = row.get("value");
        let serial: i64 = value.parse().map_err(|_| OracleError::NotFound("pypi_serial"))?;
        Ok(PypiSerial(serial))
    }

    /// Advance the PyPI `serial` watermark.
    async fn set_pypi(&self, serial: PypiSerial) -> Result<(), OracleError> {
        sqlx::query("UPDATE metadata SET value = $1 WHERE key = 'pypi_serial'")
            .bind(serial.0.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Whether the build farm is currently accepting new build assignments.
    async fn build_active(&self) -> Result<bool, OracleError> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = 'build_active'")
            .fetch_optional(&self.pool)
            .await?
            .ok_or(OracleError::NotFound("build_active"))?;
        let value: String = row.get("value");
        Ok(value == "true")
    }

    /// Flip the farm-wide pause switch.
    async fn set_active(&self, active: bool) -> Result<(), OracleError> {
        sqlx::query("UPDATE metadata SET value = $1 WHERE key = 'build_active'")
            .bind(if active { "true" } else { "false" })
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- Aggregate statistics --------------------------------------------------

    /// Aggregate build/file statistics, as `(success, fail, total)`.
    async fn get_stats(&self) -> Result<(i64, i64, i64), OracleError> {
        let row = sqlx::query(
            "SELECT \
                COUNT(CASE WHEN status THEN 1 END) AS success, \
                COUNT(CASE WHEN NOT status THEN 1 END) AS fail, \
                COUNT(*) AS total \
             FROM builds",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((row.get("success"), row.get("fail"), row.get("total")))
    }

    /// Per-package build summary: `(attempted, succeeded, file_count)`.
    async fn pkg_summary(&self, package: &str) -> Result<(i64, i64, i64), OracleError> {
        let row = sqlx::query(
            "SELECT \
                (SELECT COUNT(*) FROM builds WHERE package = $1) AS attempted, \
                (SELECT COUNT(*) FROM builds WHERE package = $1 AND status) AS succeeded, \
                (SELECT COUNT(*) FROM files f JOIN builds b ON b.build_id = f.build_id \
                    WHERE b.package = $1) AS file_count",
        )
        .bind(package)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.get("attempted"), row.get("succeeded"), row.get("file_count")))
    }

    /// Timestamp of the most recent successful build of any package, as the
    /// package name that owns it (mirrors `get_last_package_built`).
    async fn last_built(&self) -> Result<String, OracleError> {
        let row = sqlx::query(
            "SELECT package FROM builds ORDER BY build_timestamp DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or(OracleError::NotFound("builds"))?;
        Ok(row.get("package"))
    }

    /// Total wall-clock time spent building, in seconds.
    async fn total_build_time(&self) -> Result<f64, OracleError> {
        let row = sqlx::query("SELECT COALESCE(SUM(build_time), 0) AS total FROM builds")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("total"))
    }

    /// The single longest build ever recorded, as `(package, build_time)`.
    async fn longest_build(&self) -> Result<(String, f64), OracleError> {
        let row = sqlx::query(
            "SELECT package, build_time FROM builds ORDER BY build_time DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or(OracleError::NotFound("builds"))?;
        Ok((row.get("package"), row.get("build_time")))
    }

    /// Total size of every published file, in bytes.
    async fn total_size(&self) -> Result<i64, OracleError> {
        let row = sqlx::query("SELECT COALESCE(SUM(filesize), 0) AS total FROM files")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("total"))
    }

    /// Number of distinct packages with at least one successful build.
    async fn packages_built_count(&self) -> Result<i64, OracleError> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT package) AS n FROM builds WHERE status",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    /// Total number of published files.
    async fn files_count(&self) -> Result<i64, OracleError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM files")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Downloads recorded in the trailing 30 days.
    ///
    /// The original `downloads_recent` view this mirrors is marked failing
    /// upstream and its exact definition is out of scope here (see
    /// `DESIGN.md`); this is a plain rolling-window count over the
    /// `downloads` table instead.
    async fn downloads_last_month(&self) -> Result<i64, OracleError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM downloads WHERE accessed_at > now() - interval '30 days'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    /// Download counts per package, ordered most-downloaded first, for the
    /// search index the Scribe publishes as `packages.json`.
    async fn search_counts(&self) -> Result<Vec<(String, i64)>, OracleError> {
        let rows = sqlx::query(
            "SELECT p.name AS package, COUNT(d.filename) AS count \
             FROM packages p \
             LEFT JOIN builds b ON b.package = p.name AND b.status \
             LEFT JOIN files f ON f.build_id = b.build_id \
             LEFT JOIN downloads d ON d.filename = f.filename \
             GROUP BY p.name \
             ORDER BY count DESC, p.name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| (r.get("package"), r.get("count"))).collect())
    }

    // -- Dispatch ---------------------------------------------------------------

    /// Handle a single [`OracleRequest`], returning the [`OracleReply`] to
    /// send back through Seraph.
    ///
    /// Never panics: every SQL failure is caught and reported as
    /// [`OracleReply::Err`] rather than unwinding the caller's task.
    pub async fn handle(&self, request: OracleRequest) -> OracleReply {
        let result = self.handle_inner(request).await;
        match result {
            Ok(value) => OracleReply::Ok { value },
            Err(e) => OracleReply::Err {
                code: e.code().as_str().to_string(),
                message: e.to_string(),
            },
        }
    }

    async fn handle_inner(&self, request: OracleRequest) -> Result<OracleValue, OracleError> {
        use OracleRequest as Q;
        use OracleValue as V;
        Ok(match request {
            Q::AllPkgs => V::Packages(self.all_pkgs().await?),
            Q::AllVers => V::Versions(self.all_vers().await?),
            Q::NewPkg { package } => {
                self.new_pkg(&package).await?;
                V::Ack
            }
            Q::NewVer { package, version } => {
                self.new_ver(&package, &version).await?;
                V::Ack
            }
            Q::SkipPkg { package, reason } => {
                self.skip_pkg(&package, &reason).await?;
                V::Ack
            }
            Q::SkipVer {
                package,
                version,
                reason,
            } => {
                self.skip_ver(&package, &version, &reason).await?;
                V::Ack
            }
            Q::PkgExists { package } => V::Bool(self.pkg_exists(&package).await?),
            Q::LogDownload {
                filename,
                host_family,
            } => {
                self.log_download(&filename, &host_family).await?;
                V::Ack
            }
            Q::LogBuild {
                package,
                version,
                status,
                duration,
                output,
                built_by,
                files,
            } => {
                let build_id = self
                    .log_build(&package, &version, status, duration, &output, built_by, &files)
                    .await?;
                V::BuildId(build_id)
            }
            Q::DelBuild { build_id } => {
                self.del_build(build_id).await?;
                V::Ack
            }
            Q::PkgFiles { package } => V::Files(self.pkg_files(&package).await?),
            Q::VerFiles { package, version } => V::Files(self.ver_files(&package, &version).await?),
            Q::GetAbis => V::Tags(self.get_abis().await?),
            Q::BuildableTargets => V::Targets(self.buildable_targets().await?),
            Q::GetPypi => V::Serial(self.get_pypi().await?),
            Q::SetPypi { serial } => {
                self.set_pypi(serial).await?;
                V::Ack
            }
            Q::GetStats => {
                let (success, fail, total) = self.get_stats().await?;
                V::Stats { success, fail, total }
            }
            Q::PkgSummary { package } => {
                let (attempted, succeeded, files) = self.pkg_summary(&package).await?;
                V::Stats {
                    success: succeeded,
                    fail: attempted - succeeded,
                    total: files,
                }
            }
            Q::PackagesBuiltCount => V::Number(self.packages_built_count().await? as f64),
            Q::FilesCount => V::Number(self.files_count().await? as f64),
            Q::DownloadsLastMonth => V::Number(self.downloads_last_month().await? as f64),
            Q::SearchCounts => V::Counts(self.search_counts().await?),
            Q::LastBuilt => V::Tags(vec![self.last_built().await?]),
            Q::BuildTime => V::Number(self.total_build_time().await?),
            Q::LongestBuild => {
                let (package, build_time) = self.longest_build().await?;
                V::Tags(vec![package, build_time.to_string()])
            }
            Q::TotalSize => V::Number(self.total_size().await? as f64),
            Q::BuildActive => V::Bool(self.build_active().await?),
            Q::SetActive { active } => {
                self.set_active(active).await?;
                V::Ack
            }
        })
    }

    /// Drive the single-writer processing loop: receive `(request, reply)`
    /// pairs from `rx` and answer each one in turn before pulling the next.
    ///
    /// This is the only place requests are ever actually executed against
    /// the pool; Seraph fans many clients into this one channel.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<(OracleRequest, oneshot::Sender<OracleReply>)>,
    ) {
        while let Some((request, reply_tx)) = rx.recv().await {
            let reply = self.handle(request).await;
            if reply_tx.send(reply).is_err() {
                tracing::debug!("oracle reply receiver dropped before send");
            }
        }
        tracing::info!("oracle request channel closed, shutting down");
    }
}

fn file_record_from_row(row: sqlx::postgres::PgRow) -> FileRecord {
    FileRecord {
        filename: row.get("filename"),
        build_id: row.get("build_id"),
        filesize: row.get("filesize"),
        filehash: row.get("filehash"),
        package_version_tag: row.get("package_version_tag"),
        py_version_tag: row.get("py_version_tag"),
        abi_tag: row.get("abi_tag"),
        platform_tag: row.get("platform_tag"),
    }
}
