// Minimal xlsx support: a workbook is a zip of small XML parts. The
// writer emits inline strings and plain numeric cells; the reader
// scans the first worksheet tolerantly and hands back cell text.
// Covers what roster import and report export need, nothing more.

use anyhow::{anyhow, Context};
use chrono::Utc;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
}

impl Cell {
    pub fn text(s: impl Into<String>) -> Self {
        Cell::Text(s.into())
    }
}

pub fn write_workbook(out_path: &Path, sheet_name: &str, rows: &[Vec<Cell>]) -> anyhow::Result<()> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let content_types = concat!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n",
        "<Types xmlns=\"http://schemas.openxmlformats.org/package/2006/content-types\">",
        "<Default Extension=\"rels\" ContentType=\"application/vnd.openxmlformats-package.relationships+xml\"/>",
        "<Default Extension=\"xml\" ContentType=\"application/xml\"/>",
        "<Override PartName=\"/xl/workbook.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml\"/>",
        "<Override PartName=\"/xl/worksheets/sheet1.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml\"/>",
        "<Override PartName=\"/docProps/core.xml\" ContentType=\"application/vnd.openxmlformats-package.core-properties+xml\"/>",
        "</Types>"
    );
    zip.start_file("[Content_Types].xml", opts)
        .context("failed to start content types entry")?;
    zip.write_all(content_types.as_bytes())
        .context("failed to write content types entry")?;

    let root_rels = concat!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n",
        "<Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">",
        "<Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument\" Target=\"xl/workbook.xml\"/>",
        "<Relationship Id=\"rId2\" Type=\"http://schemas.openxmlformats.org/package/2006/relationships/metadata/core-properties\" Target=\"docProps/core.xml\"/>",
        "</Relationships>"
    );
    zip.start_file("_rels/.rels", opts)
        .context("failed to start root relationships entry")?;
    zip.write_all(root_rels.as_bytes())
        .context("failed to write root relationships entry")?;

    let created = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let core = format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n",
            "<cp:coreProperties xmlns:cp=\"http://schemas.openxmlformats.org/package/2006/metadata/core-properties\" ",
            "xmlns:dc=\"http://purl.org/dc/elements/1.1/\" xmlns:dcterms=\"http://purl.org/dc/terms/\" ",
            "xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">",
            "<dc:creator>nilaid</dc:creator>",
            "<dcterms:created xsi:type=\"dcterms:W3CDTF\">{}</dcterms:created>",
            "</cp:coreProperties>"
        ),
        created
    );
    zip.start_file("docProps/core.xml", opts)
        .context("failed to start core properties entry")?;
    zip.write_all(core.as_bytes())
        .context("failed to write core properties entry")?;

    let workbook = format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n",
            "<workbook xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\" ",
            "xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\">",
            "<sheets><sheet name=\"{}\" sheetId=\"1\" r:id=\"rId1\"/></sheets>",
            "</workbook>"
        ),
        xml_escape(sheet_name)
    );
    zip.start_file("xl/workbook.xml", opts)
        .context("failed to start workbook entry")?;
    zip.write_all(workbook.as_bytes())
        .context("failed to write workbook entry")?;

    let workbook_rels = concat!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n",
        "<Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">",
        "<Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" Target=\"worksheets/sheet1.xml\"/>",
        "</Relationships>"
    );
    zip.start_file("xl/_rels/workbook.xml.rels", opts)
        .context("failed to start workbook relationships entry")?;
    zip.write_all(workbook_rels.as_bytes())
        .context("failed to write workbook relationships entry")?;

    let mut sheet = String::new();
    sheet.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n");
    sheet.push_str(
        "<worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\">",
    );
    sheet.push_str("<sheetData>");
    for (row_idx, row) in rows.iter().enumerate() {
        sheet.push_str(&format!("<row r=\"{}\">", row_idx + 1));
        for (col_idx, cell) in row.iter().enumerate() {
            let cell_ref = format!("{}{}", col_ref(col_idx), row_idx + 1);
            match cell {
                Cell::Empty => {}
                Cell::Text(s) => {
                    sheet.push_str(&format!(
                        "<c r=\"{}\" t=\"inlineStr\"><is><t>{}</t></is></c>",
                        cell_ref,
                        xml_escape(s)
                    ));
                }
                Cell::Number(v) => {
                    sheet.push_str(&format!("<c r=\"{}\"><v>{}</v></c>", cell_ref, number_text(*v)));
                }
            }
        }
        sheet.push_str("</row>");
    }
    sheet.push_str("</sheetData></worksheet>");
    zip.start_file("xl/worksheets/sheet1.xml", opts)
        .context("failed to start worksheet entry")?;
    zip.write_all(sheet.as_bytes())
        .context("failed to write worksheet entry")?;

    zip.finish().context("failed to finalize workbook")?;
    Ok(())
}

/// Reads the first worksheet as rows of trimmed cell strings. Numeric
/// cells come back in their canonical text form.
pub fn read_workbook_strings(in_path: &Path) -> anyhow::Result<Vec<Vec<String>>> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open workbook {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("not an xlsx workbook (invalid zip)")?;

    let shared = match read_entry(&mut archive, "xl/sharedStrings.xml")? {
        Some(text) => parse_shared_strings(&text),
        None => Vec::new(),
    };

    let sheet_xml = match read_entry(&mut archive, "xl/worksheets/sheet1.xml")? {
        Some(text) => text,
        None => {
            let mut names: Vec<String> = Vec::new();
            for i in 0..archive.len() {
                let name = archive
                    .by_index(i)
                    .context("failed to scan workbook entries")?
                    .name()
                    .to_string();
                if name.starts_with("xl/worksheets/") && name.ends_with(".xml") {
                    names.push(name);
                }
            }
            names.sort();
            let Some(first) = names.first() else {
                return Err(anyhow!("workbook has no worksheets"));
            };
            read_entry(&mut archive, first)?
                .ok_or_else(|| anyhow!("workbook has no worksheets"))?
        }
    };

    Ok(parse_sheet_rows(&sheet_xml, &shared))
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> anyhow::Result<Option<String>> {
    match archive.by_name(name) {
        Ok(mut entry) => {
            let mut text = String::new();
            entry
                .read_to_string(&mut text)
                .with_context(|| format!("failed to read workbook entry {}", name))?;
            Ok(Some(text))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to open workbook entry {}", name)),
    }
}

fn parse_shared_strings(xml: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<si>").or_else(|| rest.find("<si ")) {
        let after = &rest[start..];
        let Some(end) = after.find("</si>") else {
            break;
        };
        out.push(collect_t_text(&after[..end]));
        rest = &after[end + 5..];
    }
    out
}

// A rich-text <si> holds several <t> runs; plain ones hold a single <t>.
fn collect_t_text(fragment: &str) -> String {
    let mut text = String::new();
    let mut rest = fragment;
    while let Some(start) = rest.find("<t") {
        let after = &rest[start..];
        let Some(open_end) = after.find('>') else {
            break;
        };
        if after[..open_end].ends_with('/') {
            rest = &after[open_end + 1..];
            continue;
        }
        let body = &after[open_end + 1..];
        let Some(close) = body.find("</t>") else {
            break;
        };
        text.push_str(&xml_unescape(&body[..close]));
        rest = &body[close + 4..];
    }
    text
}

fn parse_sheet_rows(xml: &str, shared: &[String]) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<row") {
        let after = &rest[start..];
        let Some(open_end) = after.find('>') else {
            break;
        };
        let open_tag = &after[..open_end];
        // Sparse sheets skip row numbers; missing r means "the next one".
        let row_idx = attr_value(open_tag, "r")
            .and_then(|s| s.trim().parse::<usize>().ok())
            .and_then(|n| n.checked_sub(1))
            .unwrap_or(rows.len());
        while rows.len() < row_idx {
            rows.push(Vec::new());
        }

        let parsed = if open_tag.ends_with('/') {
            rest = &after[open_end + 1..];
            Vec::new()
        } else {
            let body_start = open_end + 1;
            let Some(close) = after[body_start..].find("</row>") else {
                break;
            };
            let body = &after[body_start..body_start + close];
            rest = &after[body_start + close + 6..];
            parse_row_cells(body, shared)
        };
        if rows.len() == row_idx {
            rows.push(parsed);
        } else {
            rows[row_idx] = parsed;
        }
    }
    rows
}

fn parse_row_cells(row_body: &str, shared: &[String]) -> Vec<String> {
    let mut cells: Vec<String> = Vec::new();
    let mut next_col = 0usize;
    let mut rest = row_body;
    while let Some(start) = rest.find("<c") {
        let after = &rest[start..];
        let Some(open_end) = after.find('>') else {
            break;
        };
        let open_tag = &after[..open_end];
        let self_closed = open_tag.ends_with('/');
        let (body, advance) = if self_closed {
            ("", open_end + 1)
        } else {
            match after[open_end + 1..].find("</c>") {
                Some(close) => (&after[open_end + 1..open_end + 1 + close], open_end + 1 + close + 4),
                None => break,
            }
        };

        // Missing r attributes fall back to "next column along".
        let col = attr_value(open_tag, "r")
            .and_then(parse_col_index)
            .unwrap_or(next_col);
        let cell_type = attr_value(open_tag, "t").unwrap_or("");
        let value = match cell_type {
            "inlineStr" => collect_t_text(body),
            "s" => tag_body(body, "v")
                .and_then(|s| s.trim().parse::<usize>().ok())
                .and_then(|i| shared.get(i).cloned())
                .unwrap_or_default(),
            _ => tag_body(body, "v").map(xml_unescape).unwrap_or_default(),
        };

        while cells.len() < col {
            cells.push(String::new());
        }
        if cells.len() == col {
            cells.push(value.trim().to_string());
        } else {
            cells[col] = value.trim().to_string();
        }
        next_col = col + 1;
        rest = &after[advance..];
    }
    cells
}

fn tag_body<'a>(fragment: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = fragment.find(&open)? + open.len();
    let end = fragment[start..].find(&close)? + start;
    Some(&fragment[start..end])
}

fn attr_value<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!(" {}=\"", name);
    let start = tag.find(&needle)? + needle.len();
    let end = tag[start..].find('"')? + start;
    Some(&tag[start..end])
}

fn parse_col_index(cell_ref: &str) -> Option<usize> {
    let letters: String = cell_ref
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() {
        return None;
    }
    let mut idx = 0usize;
    for c in letters.chars() {
        idx = idx * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    Some(idx - 1)
}

fn col_ref(mut idx: usize) -> String {
    let mut s = String::new();
    loop {
        s.insert(0, (b'A' + (idx % 26) as u8) as char);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    s
}

fn number_text(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workbook(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .subsec_nanos();
        std::env::temp_dir().join(format!("nilaid-xlsx-{}-{}.xlsx", name, nanos))
    }

    #[test]
    fn col_refs_roll_over_past_z() {
        assert_eq!(col_ref(0), "A");
        assert_eq!(col_ref(25), "Z");
        assert_eq!(col_ref(26), "AA");
        assert_eq!(col_ref(27), "AB");
        assert_eq!(col_ref(51), "AZ");
        assert_eq!(col_ref(52), "BA");
        assert_eq!(col_ref(701), "ZZ");
        assert_eq!(col_ref(702), "AAA");
    }

    #[test]
    fn col_ref_and_parse_agree() {
        for idx in [0usize, 1, 25, 26, 27, 51, 52, 700, 702] {
            let r = format!("{}7", col_ref(idx));
            assert_eq!(parse_col_index(&r), Some(idx));
        }
    }

    #[test]
    fn escaping_round_trips() {
        let raw = "Bahasa & Sastra <Indonesia> \"kelas\" 'A'";
        assert_eq!(xml_unescape(&xml_escape(raw)), raw);
    }

    #[test]
    fn numbers_use_canonical_text() {
        assert_eq!(number_text(85.0), "85");
        assert_eq!(number_text(85.5), "85.5");
        assert_eq!(number_text(0.0), "0");
    }

    #[test]
    fn write_then_read_round_trips_cells() {
        let path = temp_workbook("roundtrip");
        let rows = vec![
            vec![
                Cell::text("nama"),
                Cell::text("nis"),
                Cell::text("kelas"),
            ],
            vec![
                Cell::text("Siti & Rahma"),
                Cell::Number(12345.0),
                Cell::text("5A"),
            ],
            vec![Cell::text("Budi"), Cell::Empty, Cell::text("5B")],
        ];
        write_workbook(&path, "Data Siswa", &rows).expect("write workbook");

        let read = read_workbook_strings(&path).expect("read workbook");
        assert_eq!(read.len(), 3);
        assert_eq!(read[0], vec!["nama", "nis", "kelas"]);
        assert_eq!(read[1], vec!["Siti & Rahma", "12345", "5A"]);
        // The empty middle cell still occupies its column.
        assert_eq!(read[2], vec!["Budi", "", "5B"]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn shared_string_cells_resolve() {
        let shared = parse_shared_strings(
            "<sst><si><t>nama</t></si><si><r><t>Sri </t></r><r><t>Wahyuni</t></r></si></sst>",
        );
        assert_eq!(shared, vec!["nama".to_string(), "Sri Wahyuni".to_string()]);

        let rows = parse_sheet_rows(
            "<sheetData><row r=\"1\"><c r=\"A1\" t=\"s\"><v>1</v></c><c r=\"C1\"><v>80</v></c></row></sheetData>",
            &shared,
        );
        assert_eq!(rows, vec![vec![
            "Sri Wahyuni".to_string(),
            String::new(),
            "80".to_string(),
        ]]);
    }

    #[test]
    fn skipped_row_numbers_keep_their_position() {
        let rows = parse_sheet_rows(
            concat!(
                "<sheetData>",
                "<row r=\"1\"><c r=\"A1\" t=\"inlineStr\"><is><t>nama</t></is></c></row>",
                "<row r=\"4\"><c r=\"A4\" t=\"inlineStr\"><is><t>Budi</t></is></c></row>",
                "</sheetData>"
            ),
            &[],
        );
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0], vec!["nama".to_string()]);
        assert!(rows[1].is_empty());
        assert!(rows[2].is_empty());
        assert_eq!(rows[3], vec!["Budi".to_string()]);
    }

    #[test]
    fn reading_a_non_workbook_fails() {
        let path = temp_workbook("not-a-zip");
        std::fs::write(&path, b"plain text, not a workbook").expect("write file");
        assert!(read_workbook_strings(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
