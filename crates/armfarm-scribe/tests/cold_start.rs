//! End-to-end scenarios against a real output directory: cold start,
//! re-running `once()` against a tree that already has files, and
//! publishing a brand-new package's per-package index.

use std::sync::Arc;

use armfarm_core::FileRecord;
use armfarm_protocol::{OracleReply, OracleRequest, OracleValue};
use armfarm_scribe::Scribe;
use armfarm_seraph::Seraph;
use tokio::sync::mpsc;

fn numpy_file() -> FileRecord {
    FileRecord {
        filename: "bar-1.0-cp34-cp34m-linux_armv7l.whl".into(),
        build_id: 1,
        filesize: 10,
        filehash: "123456abcdef".into(),
        package_version_tag: "1.0".into(),
        py_version_tag: "cp34".into(),
        abi_tag: "cp34m".into(),
        platform_tag: "linux_armv7l".into(),
    }
}

fn another_platform_file() -> FileRecord {
    FileRecord {
        filename: "bar-1.0-cp34-cp34m-linux_armv6l.whl".into(),
        build_id: 1,
        filesize: 10,
        filehash: "123456abcdef".into(),
        package_version_tag: "1.0".into(),
        py_version_tag: "cp34".into(),
        abi_tag: "cp34m".into(),
        platform_tag: "linux_armv6l".into(),
    }
}

/// Spawns an oracle stand-in that answers `ALLPKGS` with `known` and
/// `PKGFILES` with `files` regardless of which package is asked about —
/// enough for the scenarios below, which each only care about one
/// package's files at a time.
fn fake_oracle(known: Vec<String>, files: Vec<FileRecord>) -> Arc<Seraph> {
    let (tx, mut rx) = mpsc::channel::<armfarm_seraph::WorkItem>(32);
    tokio::spawn(async move {
        while let Some((req, reply_tx)) = rx.recv().await {
            let value = match req {
                OracleRequest::AllPkgs => {
                    OracleValue::Packages(known.iter().map(|p| armfarm_core::Package::new(p.clone())).collect())
                }
                OracleRequest::PkgFiles { .. } => OracleValue::Files(files.clone()),
                _ => OracleValue::Ack,
            };
            let _ = reply_tx.send(OracleReply::Ok { value });
        }
    });
    Seraph::build(vec![tx])
}

#[tokio::test]
async fn cold_start_lays_down_simple_index_and_static_assets() {
    let dir = tempfile::tempdir().unwrap();
    let seraph = fake_oracle(vec!["foo".into()], vec![]);
    let scribe = Scribe::new(seraph, dir.path());

    scribe.once().await.unwrap();

    let simple_index = tokio::fs::read_to_string(dir.path().join("simple/index.html")).await.unwrap();
    assert!(simple_index.contains(r#"<a href="foo">foo</a>"#), "{simple_index}");

    assert!(dir.path().join("style.css").exists());
    assert!(dir.path().join("favicon.ico").exists());
    assert!(!dir.path().join("index.html").exists(), "once() renders HOME separately");
}

#[tokio::test]
async fn second_start_overwrites_existing_tree_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let seraph = fake_oracle(vec!["foo".into()], vec![]);
    let scribe = Scribe::new(Arc::clone(&seraph), dir.path());
    scribe.once().await.unwrap();

    // Simulate a previous run having already populated the tree, then
    // run once() again against the same package set.
    let scribe2 = Scribe::new(seraph, dir.path());
    scribe2.once().await.unwrap();

    let simple_index = tokio::fs::read_to_string(dir.path().join("simple/index.html")).await.unwrap();
    assert_eq!(simple_index.matches("foo").count(), 2, "exactly one anchor, not a duplicated append");
}

#[tokio::test]
async fn new_package_gets_a_per_package_index_and_joins_the_root_listing() {
    let dir = tempfile::tempdir().unwrap();
    let seraph = fake_oracle(vec!["foo".into()], vec![numpy_file(), another_platform_file()]);
    let scribe = Scribe::new(seraph, dir.path());
    scribe.once().await.unwrap();

    scribe.handle(armfarm_protocol::IndexRequest::Pkg { package: "bar".into() }).await.unwrap();

    let root_index = tokio::fs::read_to_string(dir.path().join("simple/index.html")).await.unwrap();
    assert!(root_index.contains(r#"<a href="bar">bar</a>"#), "{root_index}");

    let pkg_index = tokio::fs::read_to_string(dir.path().join("simple/bar/index.html")).await.unwrap();
    assert!(
        pkg_index.contains(r#"<a href="bar-1.0-cp34-cp34m-linux_armv7l.whl#sha256=123456abcdef">"#),
        "{pkg_index}"
    );
    assert!(
        pkg_index.contains(r#"<a href="bar-1.0-cp34-cp34m-linux_armv6l.whl#sha256=123456abcdef">"#),
        "{pkg_index}"
    );
}
