use rusqlite::Connection;

use super::error::err;
use super::types::{AppState, Request};

pub fn db_conn<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

/// Stored form for NIS and kelas labels.
pub fn normalize_upper(s: &str) -> String {
    s.trim().to_uppercase()
}

/// Stored form for names: trimmed, first letter of each word upper,
/// the rest lower. A letter counts as a word start when it follows a
/// non-letter, so hyphenated and quoted names keep their capitals.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut word_start = true;
    for c in s.trim().chars() {
        if c.is_alphabetic() {
            if word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            word_start = false;
        } else {
            out.push(c);
            word_start = true;
        }
    }
    out
}

/// NIS values are short alphanumeric registry numbers.
pub fn valid_nis(nis: &str) -> bool {
    !nis.is_empty() && nis.len() <= 32 && nis.chars().all(|c| c.is_ascii_alphanumeric())
}

pub fn canonical_jenis_kelamin(raw: &str) -> Option<&'static str> {
    match raw.trim().to_lowercase().as_str() {
        "laki-laki" => Some("Laki-laki"),
        "perempuan" => Some("Perempuan"),
        _ => None,
    }
}

pub fn canonical_status(raw: &str) -> Option<&'static str> {
    match raw.trim().to_lowercase().as_str() {
        "aktif" => Some("Aktif"),
        "tidak aktif" => Some("Tidak Aktif"),
        _ => None,
    }
}
