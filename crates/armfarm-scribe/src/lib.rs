// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! armfarm-scribe
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Renders the published index tree. Every write lands on a sibling
//! temporary path and is renamed over the final target, so a reader
//! (the HTTP front-end, out of scope here) only ever sees a complete
//! previous or next version, never a partial one.

use std::collections::BTreeSet;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use armfarm_core::FileRecord;
use armfarm_protocol::{IndexRequest, OracleReply, OracleRequest, OracleValue};
use armfarm_seraph::{Seraph, SeraphError};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};

const STYLE_CSS: &[u8] = include_bytes!("../static/style.css");
const FAVICON_ICO: &[u8] = include_bytes!("../static/favicon.ico");
const HOMEPAGE_TEMPLATE: &str = include_str!("../static/index.html.tmpl");

/// Static assets copied verbatim into the output root by [`Scribe::once`],
/// excluding the homepage skeleton (which is rendered, not copied).
const BUNDLED_ASSETS: &[(&str, &[u8])] = &[("style.css", STYLE_CSS), ("favicon.ico", FAVICON_ICO)];

/// Errors arising from rendering or publishing part of the index tree.
#[derive(Debug, Error)]
pub enum ScribeError {
    /// Underlying I/O error writing or renaming a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Dispatching a request to the oracle failed.
    #[error("oracle dispatch failed: {0}")]
    Seraph(#[from] SeraphError),

    /// The oracle answered with `ERR`.
    #[error("oracle error [{code}]: {message}")]
    Oracle {
        /// Stable error code string.
        code: String,
        /// Human-readable detail.
        message: String,
    },

    /// The oracle answered with a value of the wrong shape for the verb
    /// that was sent.
    #[error("unexpected oracle reply shape for {verb}")]
    UnexpectedReply {
        /// The verb whose reply didn't match its expected shape.
        verb: &'static str,
    },

    /// The homepage template is missing a field the render needs; the
    /// file is left untouched rather than published half-rendered.
    #[error("homepage template is missing the {field} field")]
    MissingTemplateField {
        /// The field the template lacked a placeholder for.
        field: &'static str,
    },

    /// A value could not be serialized to JSON.
    #[error("value not serializable to JSON: {0}")]
    Json(#[from] serde_json::Error),
}

async fn atomic_write(path: &Path, contents: Vec<u8>) -> Result<(), ScribeError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| std::io::Error::other("target path has no parent directory"))?;
        std::fs::create_dir_all(dir)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(&contents)?;
        temp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|_| std::io::Error::other("atomic write task panicked"))??;
    Ok(())
}

fn render_simple_index(packages: &BTreeSet<String>) -> String {
    let mut out = String::from("<!DOCTYPE html>\n<html><head><title>armfarm simple index</title></head><body>\n");
    for package in packages {
        out.push_str(&format!("<a href=\"{package}\">{package}</a><br>\n"));
    }
    out.push_str("</body></html>\n");
    out
}

fn render_pkg_index(package: &str, files: &[FileRecord]) -> String {
    let mut out = format!("<!DOCTYPE html>\n<html><head><title>{package}</title></head><body>\n");
    for file in files {
        out.push_str(&format!("<a href=\"{}\">{}</a><br>\n", file.href(), file.filename));
    }
    out.push_str("</body></html>\n");
    out
}

fn render_homepage(template: &str, packages_built: i64, files_count: i64, downloads_last_month: i64) -> Result<String, ScribeError> {
    let fields: [(&str, &'static str, i64); 3] = [
        ("{{packages_built}}", "packages_built", packages_built),
        ("{{files_count}}", "files_count", files_count),
        ("{{downloads_last_month}}", "downloads_last_month", downloads_last_month),
    ];
    let mut rendered = template.to_string();
    for (placeholder, field, value) in fields {
        if !rendered.contains(placeholder) {
            return Err(ScribeError::MissingTemplateField { field });
        }
        rendered = rendered.replace(placeholder, &value.to_string());
    }
    Ok(rendered)
}

/// The task that renders and atomically publishes the static index tree.
pub struct Scribe {
    seraph: Arc<Seraph>,
    output_root: PathBuf,
    known_packages: Mutex<BTreeSet<String>>,
}

impl Scribe {
    /// Construct a scribe publishing under `output_root`. Call
    /// [`Scribe::once`] before serving traffic to seed the known-package
    /// set and lay down the bundled static assets.
    #[must_use]
    pub fn new(seraph: Arc<Seraph>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            seraph,
            output_root: output_root.into(),
            known_packages: Mutex::new(BTreeSet::new()),
        }
    }

    fn simple_dir(&self) -> PathBuf {
        self.output_root.join("simple")
    }

    fn pkg_dir(&self, package: &str) -> PathBuf {
        self.simple_dir().join(package)
    }

    async fn dispatch(&self, request: OracleRequest) -> Result<OracleValue, ScribeError> {
        match self.seraph.dispatch(request).await? {
            OracleReply::Ok { value } => Ok(value),
            OracleReply::Err { code, message } => Err(ScribeError::Oracle { code, message }),
        }
    }

    async fn write_simple_index(&self) -> Result<(), ScribeError> {
        let packages = self.known_packages.lock().await.clone();
        let rendered = render_simple_index(&packages);
        atomic_write(&self.simple_dir().join("index.html"), rendered.into_bytes()).await
    }

    /// Start-of-day routine: seeds the known-package set from the oracle,
    /// writes `simple/index.html`, and copies the bundled static assets
    /// (everything except the homepage skeleton) into the output root.
    ///
    /// Safe to re-run against a tree that already has these files — every
    /// write is atomic, so a crash mid-run never leaves a torn file.
    ///
    /// # Errors
    ///
    /// Returns [`ScribeError`] if the oracle call or any write fails.
    pub async fn once(&self) -> Result<(), ScribeError> {
        let packages = match self.dispatch(OracleRequest::AllPkgs).await? {
            OracleValue::Packages(packages) => packages,
            _ => return Err(ScribeError::UnexpectedReply { verb: "ALLPKGS" }),
        };
        {
            let mut known = self.known_packages.lock().await;
            known.clear();
            known.extend(packages.into_iter().map(|p| p.name));
        }
        tokio::fs::create_dir_all(self.simple_dir()).await?;
        self.write_simple_index().await?;
        for (name, bytes) in BUNDLED_ASSETS {
            atomic_write(&self.output_root.join(name), bytes.to_vec()).await?;
        }
        tracing::info!(root = %self.output_root.display(), "index tree initialised");
        Ok(())
    }

    async fn handle_pkg(&self, package: String) -> Result<(), ScribeError> {
        let files = match self.dispatch(OracleRequest::PkgFiles { package: package.clone() }).await? {
            OracleValue::Files(files) => files,
            _ => return Err(ScribeError::UnexpectedReply { verb: "PKGFILES" }),
        };
        let rendered = render_pkg_index(&package, &files);
        atomic_write(&self.pkg_dir(&package).join("index.html"), rendered.into_bytes()).await?;

        let is_new = {
            let mut known = self.known_packages.lock().await;
            known.insert(package.clone())
        };
        if is_new {
            self.write_simple_index().await?;
        }
        tracing::info!(package = %package, file_count = files.len(), "package index rebuilt");
        Ok(())
    }

    async fn handle_home(&self) -> Result<(), ScribeError> {
        let packages_built = match self.dispatch(OracleRequest::PackagesBuiltCount).await? {
            OracleValue::Number(n) => n as i64,
            _ => return Err(ScribeError::UnexpectedReply { verb: "PACKAGESBUILTCOUNT" }),
        };
        let files_count = match self.dispatch(OracleRequest::FilesCount).await? {
            OracleValue::Number(n) => n as i64,
            _ => return Err(ScribeError::UnexpectedReply { verb: "FILESCOUNT" }),
        };
        let downloads_last_month = match self.dispatch(OracleRequest::DownloadsLastMonth).await? {
            OracleValue::Number(n) => n as i64,
            _ => return Err(ScribeError::UnexpectedReply { verb: "DOWNLOADSLASTMONTH" }),
        };

        let rendered = render_homepage(HOMEPAGE_TEMPLATE, packages_built, files_count, downloads_last_month)?;
        atomic_write(&self.output_root.join("index.html"), rendered.into_bytes()).await?;
        tracing::info!(packages_built, files_count, downloads_last_month, "homepage rebuilt");
        Ok(())
    }

    async fn handle_search(&self) -> Result<(), ScribeError> {
        let counts = match self.dispatch(OracleRequest::SearchCounts).await? {
            OracleValue::Counts(counts) => counts,
            _ => return Err(ScribeError::UnexpectedReply { verb: "SEARCHCOUNTS" }),
        };
        let serialized = serde_json::to_vec(&counts)?;
        atomic_write(&self.output_root.join("packages.json"), serialized).await?;
        tracing::info!(count = counts.len(), "search index rebuilt");
        Ok(())
    }

    /// Handle one [`IndexRequest`].
    ///
    /// # Errors
    ///
    /// Returns [`ScribeError`] if the oracle call or the subsequent write
    /// fails; the caller (the run loop) logs and continues rather than
    /// treating this as fatal.
    pub async fn handle(&self, request: IndexRequest) -> Result<(), ScribeError> {
        match request {
            IndexRequest::Pkg { package } => self.handle_pkg(package).await,
            IndexRequest::Home => self.handle_home().await,
            IndexRequest::Search => self.handle_search().await,
        }
    }

    /// Drive the index queue: answer requests as they arrive until
    /// `control` broadcasts shutdown.
    pub async fn run(self: Arc<Self>, mut queue_rx: mpsc::Receiver<IndexRequest>, mut control: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                req = queue_rx.recv() => {
                    match req {
                        Some(request) => {
                            if let Err(e) = self.handle(request).await {
                                tracing::warn!(error = %e, "index update failed");
                            }
                        }
                        None => {
                            tracing::info!("index queue closed, scribe shutting down");
                            break;
                        }
                    }
                }
                _ = control.recv() => {
                    tracing::info!("scribe received quit signal");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armfarm_core::Package;
    use tokio::sync::mpsc as tmpsc;

    fn spawn_fake_oracle(packages: Vec<Package>, files: Vec<FileRecord>) -> Arc<Seraph> {
        let (tx, mut rx) = tmpsc::channel::<armfarm_seraph::WorkItem>(32);
        tokio::spawn(async move {
            while let Some((req, reply_tx)) = rx.recv().await {
                let value = match req {
                    OracleRequest::AllPkgs => OracleValue::Packages(packages.clone()),
                    OracleRequest::PkgFiles { .. } => OracleValue::Files(files.clone()),
                    OracleRequest::PackagesBuiltCount => OracleValue::Number(3.0),
                    OracleRequest::FilesCount => OracleValue::Number(6.0),
                    OracleRequest::DownloadsLastMonth => OracleValue::Number(42.0),
                    OracleRequest::SearchCounts => OracleValue::Counts(vec![("numpy".into(), 10), ("flask".into(), 2)]),
                    _ => OracleValue::Ack,
                };
                let _ = reply_tx.send(OracleReply::Ok { value });
            }
        });
        Seraph::build(vec![tx])
    }

    #[tokio::test]
    async fn once_seeds_known_packages_and_writes_simple_index() {
        let dir = tempfile::tempdir().unwrap();
        let seraph = spawn_fake_oracle(vec![Package::new("foo")], vec![]);
        let scribe = Scribe::new(seraph, dir.path());
        scribe.once().await.unwrap();

        let index = tokio::fs::read_to_string(dir.path().join("simple").join("index.html")).await.unwrap();
        assert!(index.contains("<a href=\"foo\">foo</a>"));
        assert!(dir.path().join("style.css").exists());
        assert!(dir.path().join("favicon.ico").exists());
        assert!(!dir.path().join("index.html").exists());
    }

    #[tokio::test]
    async fn once_is_safe_to_rerun_against_an_existing_tree() {
        let dir = tempfile::tempdir().unwrap();
        let seraph = spawn_fake_oracle(vec![Package::new("foo")], vec![]);
        let scribe = Scribe::new(seraph, dir.path());
        scribe.once().await.unwrap();
        scribe.once().await.unwrap();
        let index = tokio::fs::read_to_string(dir.path().join("simple").join("index.html")).await.unwrap();
        assert!(index.contains("foo"));
    }

    #[tokio::test]
    async fn new_package_is_added_to_the_root_index() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileRecord {
            filename: "bar-1.0-cp34-cp34m-linux_armv7l.whl".into(),
            build_id: 1,
            filesize: 10,
            filehash: "123456abcdef".into(),
            package_version_tag: "1.0".into(),
            py_version_tag: "cp34".into(),
            abi_tag: "cp34m".into(),
            platform_tag: "linux_armv7l".into(),
        };
        let seraph = spawn_fake_oracle(vec![Package::new("foo")], vec![file]);
        let scribe = Scribe::new(seraph, dir.path());
        scribe.once().await.unwrap();

        scribe.handle(IndexRequest::Pkg { package: "bar".into() }).await.unwrap();

        let root_index = tokio::fs::read_to_string(dir.path().join("simple").join("index.html")).await.unwrap();
        assert!(root_index.contains("<a href=\"bar\">bar</a>"));

        let pkg_index = tokio::fs::read_to_string(dir.path().join("simple").join("bar").join("index.html")).await.unwrap();
        assert!(pkg_index.contains("bar-1.0-cp34-cp34m-linux_armv7l.whl#sha256=123456abcdef"));
    }

    #[tokio::test]
    async fn existing_package_does_not_rewrite_the_root_index_unnecessarily() {
        let dir = tempfile::tempdir().unwrap();
        let seraph = spawn_fake_oracle(vec![Package::new("foo")], vec![]);
        let scribe = Scribe::new(seraph, dir.path());
        scribe.once().await.unwrap();
        scribe.handle(IndexRequest::Pkg { package: "foo".into() }).await.unwrap();
        assert_eq!(scribe.known_packages.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn home_renders_the_three_stats_fields() {
        let dir = tempfile::tempdir().unwrap();
        let seraph = spawn_fake_oracle(vec![], vec![]);
        let scribe = Scribe::new(seraph, dir.path());
        scribe.handle(IndexRequest::Home).await.unwrap();
        let homepage = tokio::fs::read_to_string(dir.path().join("index.html")).await.unwrap();
        assert!(homepage.contains('3'));
        assert!(homepage.contains('6'));
        assert!(homepage.contains("42"));
    }

    #[test]
    fn render_homepage_rejects_a_template_missing_a_field() {
        let err = render_homepage("no placeholders here", 1, 2, 3).unwrap_err();
        assert!(matches!(err, ScribeError::MissingTemplateField { field: "packages_built" }));
    }

    #[tokio::test]
    async fn search_writes_packages_json_as_name_count_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let seraph = spawn_fake_oracle(vec![], vec![]);
        let scribe = Scribe::new(seraph, dir.path());
        scribe.handle(IndexRequest::Search).await.unwrap();
        let json = tokio::fs::read_to_string(dir.path().join("packages.json")).await.unwrap();
        let parsed: Vec<(String, i64)> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, vec![("numpy".to_string(), 10), ("flask".to_string(), 2)]);
    }
}
