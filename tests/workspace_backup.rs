use serde_json::json;
use sha2::{Digest, Sha256};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::ZipArchive;

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_nilaid");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn nilaid");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(resp: &serde_json::Value) -> Option<&str> {
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

fn read_zip_entry(archive: &mut ZipArchive<std::fs::File>, name: &str) -> Vec<u8> {
    let mut entry = archive.by_name(name).expect("zip entry");
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes).expect("read zip entry");
    bytes
}

#[test]
fn backup_bundles_the_database_with_a_manifest() {
    let workspace = temp_dir("nilaid-backup");
    let out_dir = temp_dir("nilaid-backup-out");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    // Put at least one row in the database before bundling it.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "nama": "Ani Lestari", "nis": "111", "kelas": "5A", "jenisKelamin": "Perempuan" }),
    );

    let out_path = out_dir.join("cadangan.zip");
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.backup",
        json!({ "outPath": out_path.to_string_lossy() }),
    );
    assert_eq!(
        result.get("path").and_then(|v| v.as_str()),
        Some(out_path.to_string_lossy().as_ref())
    );
    assert_eq!(
        result.get("bundleFormat").and_then(|v| v.as_str()),
        Some("nilai-workspace-v1")
    );
    let reported_sha = result
        .get("sha256")
        .and_then(|v| v.as_str())
        .expect("sha256 in result")
        .to_string();
    assert_eq!(reported_sha.len(), 64);
    assert!(reported_sha.chars().all(|c| c.is_ascii_hexdigit()));
    let reported_size = result
        .get("sizeBytes")
        .and_then(|v| v.as_u64())
        .expect("sizeBytes in result");
    assert_eq!(
        reported_size,
        std::fs::metadata(&out_path).expect("stat bundle").len()
    );

    let file = std::fs::File::open(&out_path).expect("open bundle");
    let mut archive = ZipArchive::new(file).expect("bundle is a zip");
    let names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).expect("entry").name().to_string())
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"manifest.json".to_string()));
    assert!(names.contains(&"db/nilai.sqlite3".to_string()));

    // The digest in the result is over the database bytes inside the zip.
    let db_bytes = read_zip_entry(&mut archive, "db/nilai.sqlite3");
    let mut archived_sha = String::with_capacity(64);
    for b in Sha256::digest(&db_bytes) {
        archived_sha.push_str(&format!("{:02x}", b));
    }
    assert_eq!(archived_sha, reported_sha);

    let manifest_bytes = read_zip_entry(&mut archive, "manifest.json");
    let manifest: serde_json::Value =
        serde_json::from_slice(&manifest_bytes).expect("manifest json");
    assert_eq!(
        manifest.get("format").and_then(|v| v.as_str()),
        Some("nilai-workspace-v1")
    );
    assert_eq!(manifest.get("version").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(
        manifest["db"].get("entry").and_then(|v| v.as_str()),
        Some("db/nilai.sqlite3")
    );
    assert_eq!(
        manifest["db"].get("sha256").and_then(|v| v.as_str()),
        Some(reported_sha.as_str())
    );
    assert_eq!(
        manifest["db"].get("sizeBytes").and_then(|v| v.as_u64()),
        Some(db_bytes.len() as u64)
    );

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn backup_to_an_unwritable_path_reports_io_failed() {
    let workspace = temp_dir("nilaid-backup-io");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let blocker = workspace.join("blocker");
    std::fs::write(&blocker, b"file, not a directory").expect("write blocker");
    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.backup",
        json!({ "outPath": blocker.join("cadangan.zip").to_string_lossy() }),
    );
    assert_eq!(error_code(&resp), Some("io_failed"));

    let _ = std::fs::remove_dir_all(workspace);
}
