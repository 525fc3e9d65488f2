use anyhow::{anyhow, Context};
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/nilai.sqlite3";
pub const BUNDLE_FORMAT_V1: &str = "nilai-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub entry_count: usize,
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join("nilai.sqlite3");
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    // The digest in the manifest is over the database bytes, so read
    // them up front instead of streaming.
    let db_bytes = std::fs::read(&db_path)
        .with_context(|| format!("failed to read database {}", db_path.to_string_lossy()))?;
    let digest = Sha256::digest(&db_bytes);
    let mut sha256 = String::with_capacity(64);
    for b in digest {
        sha256.push_str(&format!("{:02x}", b));
    }

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "db": {
            "entry": DB_ENTRY,
            "sha256": sha256,
            "sizeBytes": db_bytes.len(),
        },
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    zip.write_all(&db_bytes)
        .context("failed to write database entry")?;

    let out_file = zip.finish().context("failed to finalize backup bundle")?;
    let size_bytes = out_file
        .metadata()
        .context("failed to stat backup bundle")?
        .len();

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        sha256,
        size_bytes,
        entry_count: 2,
    })
}
