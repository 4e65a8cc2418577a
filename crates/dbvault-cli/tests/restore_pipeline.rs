//! End-to-end restore pipeline tests.
//!
//! `pg_restore` and `psql` are replaced by shell shims on PATH: both drain
//! stdin and exit 0, except that `pg_restore` fails with an
//! "already exists" stderr when the stream contains a trigger marker. The
//! `psql` shim records its invocation so the SQL fallback path is
//! observable.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use dbvault_cli::config::Config;
use dbvault_cli::restore_run::{run_restore, RestoreError, RestoreOptions};

static SHIMS: OnceLock<(tempfile::TempDir, PathBuf)> = OnceLock::new();

/// Installs tool shims at the front of PATH (once per test binary) and
/// returns the path of the psql invocation log.
fn install_shims() -> PathBuf {
    let (_, marker) = SHIMS.get_or_init(|| {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("psql-invocations.log");

        write_shim(
            &dir.path().join("pg_restore"),
            "#!/bin/sh\nINPUT=$(cat)\ncase \"$INPUT\" in\n*CONFLICT-TRIGGER*)\n  echo 'ERROR: relation \"accounts\" already exists' >&2\n  exit 1\n  ;;\nesac\nexit 0\n",
        );
        write_shim(
            &dir.path().join("psql"),
            &format!(
                "#!/bin/sh\ncat > /dev/null\necho psql >> {}\nexit 0\n",
                marker.display()
            ),
        );

        let old = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{}", dir.path().display(), old));
        (dir, marker)
    });
    marker.clone()
}

fn write_shim(path: &Path, contents: &str) {
    let mut f = std::fs::File::create(path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    let mut perms = f.metadata().unwrap().permissions();
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

fn config(compression: bool, encryption: bool) -> Config {
    serde_yaml::from_str(&format!(
        r#"
version: 1
storage:
  - name: primary
    type: local
    local: {{ path: /tmp/unused }}
databases:
  - name: app
    type: postgres
    connection: {{ host: localhost, port: 5432, database: app, user: u }}
    backup:
      storage: primary
      compression: {compression}
      encryption: {{ enabled: {encryption}, password: "pw" }}
"#
    ))
    .unwrap()
}

fn opts(from: &Path) -> RestoreOptions {
    RestoreOptions {
        db: None,
        from: from.to_path_buf(),
        clean: false,
        strict_sniff: false,
        allow_sql_fallback: false,
    }
}

async fn write_artifact(dir: &Path, name: &str, raw: &[u8]) -> PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, raw).await.unwrap();
    path
}

async fn gzipped(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut src = payload;
    dbvault_codec::gzip(&mut out, &mut src).await.unwrap();
    out
}

async fn encrypted(payload: &[u8], password: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let mut src = payload;
    dbvault_codec::encrypt(&mut out, &mut src, password)
        .await
        .unwrap();
    out
}

const ARCHIVE: &[u8] = b"PGDMP\x01\x0e\x00 pretend custom archive bytes";

#[tokio::test]
async fn plain_archive_restores_through_pg_restore() {
    install_shims();
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_artifact(dir.path(), "a.dump", ARCHIVE).await;

    run_restore(&config(false, false), &opts(&path)).await.unwrap();
}

#[tokio::test]
async fn fully_encoded_artifact_is_decoded_from_observed_layers() {
    install_shims();
    let dir = tempfile::TempDir::new().unwrap();
    let body = encrypted(&gzipped(ARCHIVE).await, "pw").await;
    let path = write_artifact(dir.path(), "a.dump.gz.enc", &body).await;

    run_restore(&config(true, true), &opts(&path)).await.unwrap();
}

#[tokio::test]
async fn strict_sniff_rejects_header_mismatch() {
    install_shims();
    let dir = tempfile::TempDir::new().unwrap();
    // config says plain archive, file is gzip
    let path = write_artifact(dir.path(), "a.dump", &gzipped(ARCHIVE).await).await;

    let mut o = opts(&path);
    o.strict_sniff = true;
    let err = run_restore(&config(false, false), &o).await.unwrap_err();
    assert!(matches!(err, RestoreError::StrictMismatch { .. }), "got: {err}");
}

#[tokio::test]
async fn lenient_sniff_decodes_what_the_file_contains() {
    install_shims();
    let dir = tempfile::TempDir::new().unwrap();
    // same mismatch as above, without --strict-sniff: decode as gzip
    let path = write_artifact(dir.path(), "a.dump", &gzipped(ARCHIVE).await).await;

    run_restore(&config(false, false), &opts(&path)).await.unwrap();
}

#[tokio::test]
async fn sql_dump_requires_explicit_fallback() {
    install_shims();
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_artifact(
        dir.path(),
        "a.dump",
        b"-- PostgreSQL database dump\nCREATE TABLE t (id int);\n",
    )
    .await;

    let err = run_restore(&config(false, false), &opts(&path)).await.unwrap_err();
    assert!(matches!(err, RestoreError::UnknownRaw), "got: {err}");
}

#[tokio::test]
async fn sql_fallback_uses_psql_and_ignores_clean() {
    let marker = install_shims();
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_artifact(
        dir.path(),
        "a.dump",
        b"-- PostgreSQL database dump\nCREATE TABLE t (id int);\n",
    )
    .await;

    let mut o = opts(&path);
    o.allow_sql_fallback = true;
    o.clean = true;
    run_restore(&config(false, false), &o).await.unwrap();

    let log = std::fs::read_to_string(&marker).unwrap_or_default();
    assert!(log.contains("psql"), "psql shim was not invoked");
}

#[tokio::test]
async fn wrong_password_surfaces_before_any_tool_runs() {
    install_shims();
    let dir = tempfile::TempDir::new().unwrap();
    let body = encrypted(ARCHIVE, "other-password").await;
    let path = write_artifact(dir.path(), "a.dump.enc", &body).await;

    let err = run_restore(&config(false, true), &opts(&path)).await.unwrap_err();
    // the decrypt stage fails during the leading sniff of its output
    assert!(matches!(err, RestoreError::Sniff(_)), "got: {err}");
}

#[tokio::test]
async fn empty_artifact_is_an_error() {
    install_shims();
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_artifact(dir.path(), "a.dump", b"").await;

    let err = run_restore(&config(false, false), &opts(&path)).await.unwrap_err();
    assert!(matches!(err, RestoreError::UnknownRaw), "got: {err}");
}

#[tokio::test]
async fn conflicting_restore_gets_the_clean_hint() {
    install_shims();
    let dir = tempfile::TempDir::new().unwrap();
    let body = b"PGDMP\x01 CONFLICT-TRIGGER archive".to_vec();
    let path = write_artifact(dir.path(), "a.dump", &body).await;

    let err = run_restore(&config(false, false), &opts(&path)).await.unwrap_err();
    match &err {
        RestoreError::ToolConflict { .. } => {
            assert!(err.to_string().contains("--clean"), "hint missing: {err}");
        }
        other => panic!("expected conflict hint, got: {other}"),
    }
}

#[tokio::test]
async fn unknown_database_name_is_rejected() {
    install_shims();
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_artifact(dir.path(), "a.dump", ARCHIVE).await;

    let mut o = opts(&path);
    o.db = Some("missing".to_string());
    let err = run_restore(&config(false, false), &o).await.unwrap_err();
    assert!(matches!(err, RestoreError::UnknownDatabase(_)));
}
