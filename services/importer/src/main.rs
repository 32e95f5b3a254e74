//! Importer Service - Normalizes crime-statistics files into prefecture stats
//!
//! Responsibilities:
//! - Decode NPA / e-Stat CSV files (UTF-8 and Shift_JIS family encodings)
//! - Detect which of the three published layouts a file uses
//! - Parse rows into per-prefecture records despite noisy section structure
//! - Resolve free-text prefecture and crime-category labels to canonical ids
//! - Deduplicate on (year, prefecture_code, crime_category) and upsert in one batch
//! - Track job runs for auditing
//!
//! CRITICAL: parsing and planning must be DETERMINISTIC
//! Same file + same arguments = same upsert plan
//!
//! Usage:
//!   # NPA monthly bulletin (year inferred from the era filename):
//!   cargo run --bin importer -- data/r08_1-1.csv
//!
//!   # e-Stat table without a year column:
//!   cargo run --bin importer -- data/estat_table3.csv --year 2023 --dry-run

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use encoding_rs::{Encoding, SHIFT_JIS, UTF_8};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "importer",
    about = "Imports NPA / e-Stat crime statistics into prefecture_stats"
)]
struct Args {
    /// Path to the statistics CSV file
    file: PathBuf,

    /// Year to use when the file carries no year of its own (e.g. 2023)
    #[arg(long)]
    year: Option<i32>,

    /// Dry run - parse and plan only, don't write to the database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            db_url: std::env::var("DB_URL").context("DB_URL env var missing")?,
        })
    }
}

/// Provenance tag stamped on every row this pipeline writes.
const SOURCE_TAG: &str = "npa_estat";

/// Fatal import failures. Any of these aborts the whole file with no writes;
/// per-row problems (unknown prefecture, unmapped category) are handled as
/// skips and never surface here.
#[derive(Debug, Error)]
enum ImportError {
    #[error("could not decode {path} with any candidate encoding")]
    Decode { path: String },

    #[error("unsupported file layout; header: {header:?}")]
    UnsupportedFormat { header: Vec<String> },

    #[error("cannot determine the statistics year; pass --year")]
    YearUnresolved,

    #[error("no table sections found; the report layout may have changed")]
    NoSectionsFound,
}

// =============================================================================
// Data model
// =============================================================================

/// One parsed row before reference resolution. `count_recognized` is
/// mandatory: every parser drops rows where it is missing or non-numeric.
/// The other counts stay `None` when the source doesn't publish them.
#[derive(Debug, Clone, PartialEq)]
struct ParsedRecord {
    year: i32,
    prefecture_name: String,
    crime_category: String,
    count_recognized: i64,
    count_cleared: Option<i64>,
    count_arrested: Option<i64>,
}

/// One row of the write set, keyed by (year, prefecture_code, crime_category).
#[derive(Debug, Clone, PartialEq, Serialize)]
struct StatRow {
    year: i32,
    prefecture_code: String,
    prefecture_name: String,
    crime_category: String,
    crime_type: String,
    count_recognized: i64,
    count_cleared: Option<i64>,
    count_arrested: Option<i64>,
    /// EWKT point of the prefecture's representative coordinate.
    location: String,
    source: String,
}

/// The outcome of deduplication and resolution for one file. Computed the
/// same way in dry-run and live mode; only execution differs.
#[derive(Debug, PartialEq)]
struct UpsertPlan {
    rows: Vec<StatRow>,
    skipped_unresolved: Vec<String>,
    skipped_duplicates: usize,
}

impl UpsertPlan {
    fn skipped_total(&self) -> usize {
        self.skipped_unresolved.len() + self.skipped_duplicates
    }
}

// =============================================================================
// Prefecture reference data
// =============================================================================

/// Canonical prefecture entry: JIS code, official name, representative
/// coordinate used for map layers.
#[derive(Debug)]
struct Prefecture {
    code: &'static str,
    name: &'static str,
    lat: f64,
    lng: f64,
}

/// The 47 prefectures in JIS X 0401 code order.
const PREFECTURE_MASTER: &[Prefecture] = &[
    Prefecture { code: "01", name: "北海道", lat: 43.0642, lng: 141.3469 },
    Prefecture { code: "02", name: "青森県", lat: 40.8244, lng: 140.7400 },
    Prefecture { code: "03", name: "岩手県", lat: 39.7036, lng: 141.1527 },
    Prefecture { code: "04", name: "宮城県", lat: 38.2688, lng: 140.8721 },
    Prefecture { code: "05", name: "秋田県", lat: 39.7186, lng: 140.1023 },
    Prefecture { code: "06", name: "山形県", lat: 38.2404, lng: 140.3636 },
    Prefecture { code: "07", name: "福島県", lat: 37.7608, lng: 140.4747 },
    Prefecture { code: "08", name: "茨城県", lat: 36.3418, lng: 140.4468 },
    Prefecture { code: "09", name: "栃木県", lat: 36.5657, lng: 139.8836 },
    Prefecture { code: "10", name: "群馬県", lat: 36.3911, lng: 139.0608 },
    Prefecture { code: "11", name: "埼玉県", lat: 35.8570, lng: 139.6489 },
    Prefecture { code: "12", name: "千葉県", lat: 35.6047, lng: 140.1233 },
    Prefecture { code: "13", name: "東京都", lat: 35.6894, lng: 139.6917 },
    Prefecture { code: "14", name: "神奈川県", lat: 35.4475, lng: 139.6425 },
    Prefecture { code: "15", name: "新潟県", lat: 37.9023, lng: 139.0235 },
    Prefecture { code: "16", name: "富山県", lat: 36.6953, lng: 137.2113 },
    Prefecture { code: "17", name: "石川県", lat: 36.5944, lng: 136.6256 },
    Prefecture { code: "18", name: "福井県", lat: 36.0652, lng: 136.2219 },
    Prefecture { code: "19", name: "山梨県", lat: 35.6642, lng: 138.5681 },
    Prefecture { code: "20", name: "長野県", lat: 36.6513, lng: 138.1810 },
    Prefecture { code: "21", name: "岐阜県", lat: 35.3912, lng: 136.7223 },
    Prefecture { code: "22", name: "静岡県", lat: 34.9769, lng: 138.3831 },
    Prefecture { code: "23", name: "愛知県", lat: 35.1802, lng: 136.9066 },
    Prefecture { code: "24", name: "三重県", lat: 34.7303, lng: 136.5086 },
    Prefecture { code: "25", name: "滋賀県", lat: 35.0045, lng: 135.8686 },
    Prefecture { code: "26", name: "京都府", lat: 35.0211, lng: 135.7556 },
    Prefecture { code: "27", name: "大阪府", lat: 34.6863, lng: 135.5200 },
    Prefecture { code: "28", name: "兵庫県", lat: 34.6913, lng: 135.1830 },
    Prefecture { code: "29", name: "奈良県", lat: 34.6851, lng: 135.8328 },
    Prefecture { code: "30", name: "和歌山県", lat: 34.2261, lng: 135.1675 },
    Prefecture { code: "31", name: "鳥取県", lat: 35.5036, lng: 134.2383 },
    Prefecture { code: "32", name: "島根県", lat: 35.4722, lng: 133.0505 },
    Prefecture { code: "33", name: "岡山県", lat: 34.6617, lng: 133.9344 },
    Prefecture { code: "34", name: "広島県", lat: 34.3963, lng: 132.4596 },
    Prefecture { code: "35", name: "山口県", lat: 34.1861, lng: 131.4706 },
    Prefecture { code: "36", name: "徳島県", lat: 34.0658, lng: 134.5593 },
    Prefecture { code: "37", name: "香川県", lat: 34.3401, lng: 134.0434 },
    Prefecture { code: "38", name: "愛媛県", lat: 33.8416, lng: 132.7657 },
    Prefecture { code: "39", name: "高知県", lat: 33.5597, lng: 133.5311 },
    Prefecture { code: "40", name: "福岡県", lat: 33.6064, lng: 130.4183 },
    Prefecture { code: "41", name: "佐賀県", lat: 33.2494, lng: 130.2988 },
    Prefecture { code: "42", name: "長崎県", lat: 32.7503, lng: 129.8777 },
    Prefecture { code: "43", name: "熊本県", lat: 32.7898, lng: 130.7417 },
    Prefecture { code: "44", name: "大分県", lat: 33.2382, lng: 131.6126 },
    Prefecture { code: "45", name: "宮崎県", lat: 31.9110, lng: 131.4239 },
    Prefecture { code: "46", name: "鹿児島県", lat: 31.5602, lng: 130.5581 },
    Prefecture { code: "47", name: "沖縄県", lat: 26.2124, lng: 127.6809 },
];

/// Historically-abbreviated forms seen in source files, mapped to the
/// official suffixed name.
const PREFECTURE_ALIASES: &[(&str, &str)] = &[
    ("東京", "東京都"),
    ("大阪", "大阪府"),
    ("京都", "京都府"),
    ("神奈川", "神奈川県"),
    ("和歌山", "和歌山県"),
    ("鹿児島", "鹿児島県"),
];

/// Resolves a free-text prefecture label: exact match first, then the alias
/// table, then a substring pass in table order (either direction, first match
/// wins). Returns None when nothing matches; callers treat that as a row
/// skip, not an error, because operator-entered labels carry occasional typos.
fn resolve_prefecture(name: &str) -> Option<&'static Prefecture> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    if let Some(p) = PREFECTURE_MASTER.iter().find(|p| p.name == name) {
        return Some(p);
    }
    if let Some((_, canonical)) = PREFECTURE_ALIASES.iter().find(|(alias, _)| *alias == name) {
        if let Some(p) = PREFECTURE_MASTER.iter().find(|p| p.name == *canonical) {
            return Some(p);
        }
    }
    PREFECTURE_MASTER
        .iter()
        .find(|p| name.contains(p.name) || p.name.contains(name))
}

// =============================================================================
// Crime-category mapping (NPA taxonomy -> canonical crime_type)
// =============================================================================

/// Fine-grained NPA category -> canonical bucket. Checked before the
/// umbrella-keyword fallback.
const CRIME_TYPE_MAP: &[(&str, &str)] = &[
    // 凶悪犯
    ("殺人", "殺人・傷害致死"),
    ("強盗", "暴行・傷害"),
    ("放火", "その他"),
    ("不同意性交等", "性犯罪"),
    ("強姦", "性犯罪"),
    ("強制性交等", "性犯罪"),
    // 粗暴犯
    ("暴行", "暴行・傷害"),
    ("傷害", "暴行・傷害"),
    ("傷害致死", "殺人・傷害致死"),
    ("脅迫", "暴行・傷害"),
    ("恐喝", "暴行・傷害"),
    ("凶器準備集合", "暴行・傷害"),
    // 窃盗犯
    ("窃盗", "窃盗・万引き"),
    ("侵入盗", "窃盗・万引き"),
    ("乗り物盗", "窃盗・万引き"),
    ("非侵入盗", "窃盗・万引き"),
    ("ひったくり", "窃盗・万引き"),
    ("すり", "窃盗・万引き"),
    ("自動車盗", "窃盗・万引き"),
    // 知能犯
    ("詐欺", "詐欺"),
    ("横領", "詐欺"),
    ("偽造", "詐欺"),
    ("背任", "詐欺"),
    ("汚職", "詐欺"),
    // 風俗犯
    ("わいせつ", "性犯罪"),
    ("強制わいせつ", "性犯罪"),
    ("不同意わいせつ", "性犯罪"),
    ("賭博", "その他"),
    // その他
    ("住居侵入", "その他"),
    ("器物損壊", "その他"),
    ("公務執行妨害", "その他"),
    ("略取誘拐", "その他"),
    ("人身売買", "その他"),
    ("占有離脱物横領", "その他"),
];

/// Umbrella keywords for category labels the fine-grained table doesn't
/// cover, checked as substrings in this order.
const CRIME_CATEGORY_FALLBACK: &[(&str, &str)] = &[
    ("凶悪犯", "殺人・傷害致死"),
    ("粗暴犯", "暴行・傷害"),
    ("窃盗犯", "窃盗・万引き"),
    ("知能犯", "詐欺"),
    ("風俗犯", "性犯罪"),
    ("重要犯罪", "その他"),
];

const CRIME_TYPE_DEFAULT: &str = "その他";

/// Maps a source category label to the canonical crime type. Total: novel
/// labels land in the default bucket instead of blocking the import.
fn map_crime_type(category: &str) -> &'static str {
    let s = category.trim();
    if let Some((_, bucket)) = CRIME_TYPE_MAP.iter().find(|(raw, _)| *raw == s) {
        return bucket;
    }
    if let Some((_, bucket)) = CRIME_CATEGORY_FALLBACK
        .iter()
        .find(|(keyword, _)| s.contains(keyword))
    {
        return bucket;
    }
    CRIME_TYPE_DEFAULT
}

// =============================================================================
// Encoding-resilient reader
// =============================================================================

/// Decoded file content: the raw text for layout sniffing plus the non-blank
/// CSV rows.
#[derive(Debug)]
struct RawTable {
    text: String,
    rows: Vec<Vec<String>>,
}

/// Candidate encodings in preference order. UTF-8 first (a leading BOM is
/// sniffed and stripped), then the WHATWG Shift_JIS decoder, which accepts
/// both the Shift_JIS and CP932 labels. The list is passed into the reader
/// so tests can substitute their own.
fn encoding_candidates() -> [&'static Encoding; 2] {
    [UTF_8, SHIFT_JIS]
}

/// Decodes bytes with the first candidate that decodes without error and
/// yields at least one non-blank row. Returns None when every candidate
/// fails; garbled statistical data must never be silently accepted.
fn decode_table(bytes: &[u8], encodings: &[&'static Encoding]) -> Option<RawTable> {
    for enc in encodings {
        let (text, _, had_errors) = enc.decode(bytes);
        if had_errors {
            continue;
        }
        let rows = rows_from_text(&text);
        if !rows.is_empty() {
            return Some(RawTable {
                text: text.into_owned(),
                rows,
            });
        }
    }
    None
}

fn read_table(path: &Path, encodings: &[&'static Encoding]) -> Result<RawTable> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    decode_table(&bytes, encodings).ok_or_else(|| {
        ImportError::Decode {
            path: path.display().to_string(),
        }
        .into()
    })
}

/// Parses decoded text as CSV. `flexible` because the bulletin layouts have
/// ragged row widths; rows whose cells are all blank are dropped here so the
/// parsers never see them.
fn rows_from_text(text: &str) -> Vec<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                eprintln!("Warning: skipping malformed CSV record: {e}");
                continue;
            }
        };
        let row: Vec<String> = record.iter().map(|c| c.to_string()).collect();
        if row.iter().any(|c| !c.is_empty()) {
            rows.push(row);
        }
    }
    rows
}

/// Parses a count cell. Commas are thousands separators; ASCII and
/// typographic dashes are placeholders for "not published", so a dash-only
/// cell is None, never zero.
fn parse_count(cell: &str) -> Option<i64> {
    let cleaned: String = cell
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '-' | '−' | '－'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

// =============================================================================
// Format classification
// =============================================================================

/// The three published layouts. Classification is a pure function of the
/// file's head and header row; each variant maps to exactly one parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    MultiSectionReport,
    DateKeyedTable,
    SimpleTable,
}

/// Section markers used by the monthly bulletin, in full- and half-width
/// digit forms.
const NPA_TABLE_MARKERS: &[&str] = &[
    "第１表", "第1表", "第３表", "第3表", "第４表", "第4表", "第６表", "第6表",
];

/// Lowercases and strips underscores so header matching tolerates the
/// spelling drift between releases.
fn normalize_header(cell: &str) -> String {
    cell.trim().to_lowercase().replace('_', "")
}

fn classify_layout(text: &str, header: &[String]) -> Result<Layout, ImportError> {
    let head: String = text.chars().take(200).collect();
    if NPA_TABLE_MARKERS.iter().any(|m| head.contains(m)) {
        return Ok(Layout::MultiSectionReport);
    }

    let has_exact = |name: &str| header.iter().any(|c| c.trim() == name);
    if has_exact("日付") && has_exact("罪種") {
        return Ok(Layout::DateKeyedTable);
    }

    let has_prefecture = header
        .iter()
        .any(|c| c.contains("都道府県") || normalize_header(c).contains("prefecture"));
    let has_recognized = header.iter().any(|c| c.contains("認知件数"));
    if has_prefecture && has_recognized {
        return Ok(Layout::SimpleTable);
    }

    Err(ImportError::UnsupportedFormat {
        header: header.to_vec(),
    })
}

// =============================================================================
// Multi-section report parser (NPA monthly bulletin)
// =============================================================================

/// Western year for an era-prefixed bulletin filename; r08_1-1.csv means
/// Reiwa 8, i.e. 2026.
fn year_from_era_filename(path: &Path) -> Option<i32> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix(['r', 'R'])?;
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let (digits, tail) = rest.split_at(digits_end);
    if digits.is_empty() || !tail.starts_with('_') {
        return None;
    }
    let era_year: i32 = digits.parse().ok()?;
    Some(2018 + era_year)
}

/// True for cells shaped like a numbered table marker (第3表, 第１０表, ...),
/// in either digit width.
fn is_table_marker(cell: &str) -> bool {
    let Some(rest) = cell.strip_prefix('第') else {
        return false;
    };
    let after = rest.trim_start_matches(|c: char| c.is_ascii_digit() || ('０'..='９').contains(&c));
    after.len() != rest.len() && after.starts_with('表')
}

/// Extracts the first parenthesized run from a row's joined text, accepting
/// both full-width and ASCII parentheses.
fn parenthetical(text: &str) -> Option<String> {
    let start = text.find(['（', '('])?;
    let open = text[start..].chars().next()?;
    let rest = &text[start + open.len_utf8()..];
    let end = rest.find(['）', ')'])?;
    Some(rest[..end].trim().to_string())
}

/// Aggregate sub-tables that must not become sections: their totals overlap
/// the per-category tables and would double-count in aggregation.
const SECTION_DENYLIST: &[&str] = &[
    "重要犯罪総数",
    "重要窃盗犯総数",
    "侵入盗−住宅対象",
    "侵入盗−その他",
];

/// A detected table boundary: where it starts and, when the table is one we
/// aggregate, its crime-category label. Unlabeled boundaries still terminate
/// the preceding section so an ignored sub-table never leaks its rows into
/// the section above it.
#[derive(Debug)]
struct SectionBoundary {
    row: usize,
    category: Option<String>,
}

fn detect_sections(rows: &[Vec<String>]) -> Vec<SectionBoundary> {
    let mut boundaries = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        let Some(cell0) = row.first().map(|c| c.trim()) else {
            continue;
        };
        if cell0.is_empty() {
            continue;
        }
        let head: String = row.iter().take(6).map(String::as_str).collect();

        // 第3表: 刑法犯総数 都道府県別
        let category = if cell0.starts_with("第３表")
            || cell0.starts_with("第3表")
            || (cell0.starts_with('第') && head.contains("刑法犯総数"))
        {
            Some("刑法犯総数".to_string())
        // 第4表: 窃盗犯総数 都道府県別
        } else if (cell0.starts_with("第４表") || cell0.starts_with("第4表"))
            && head.contains("窃盗")
        {
            Some("窃盗犯".to_string())
        // 第6表: one sub-table per 重要犯罪 category, named in parentheses
        } else if cell0.starts_with("第６表") || cell0.starts_with("第6表") {
            let text: String = row.iter().map(String::as_str).collect();
            parenthetical(&text).filter(|name| !SECTION_DENYLIST.contains(&name.as_str()))
        } else if is_table_marker(cell0) {
            None
        } else {
            continue;
        };

        boundaries.push(SectionBoundary { row: i, category });
    }
    boundaries
}

/// Parses the monthly bulletin layout: several stacked per-category tables
/// with no machine-friendly header. The year comes from --year or from the
/// era-prefixed filename.
fn parse_npa_monthly(
    rows: &[Vec<String>],
    path: &Path,
    year_override: Option<i32>,
) -> Result<Vec<ParsedRecord>, ImportError> {
    let year = year_override
        .or_else(|| year_from_era_filename(path))
        .ok_or(ImportError::YearUnresolved)?;

    let boundaries = detect_sections(rows);
    if !boundaries.iter().any(|b| b.category.is_some()) {
        return Err(ImportError::NoSectionsFound);
    }

    let mut records = Vec::new();
    for (idx, boundary) in boundaries.iter().enumerate() {
        let Some(category) = &boundary.category else {
            continue;
        };
        let end = boundaries.get(idx + 1).map_or(rows.len(), |b| b.row);

        // Header lines vary between report revisions; probe for the first row
        // whose third cell is numeric.
        let mut data_start = boundary.row + 1;
        for j in boundary.row + 1..end.min(boundary.row + 15) {
            if rows[j].len() > 2 && parse_count(&rows[j][2]).is_some() {
                data_start = j;
                break;
            }
        }

        let section = parse_npa_section(&rows[data_start..end], year, category);
        println!("  {}: {} records", category, section.len());
        records.extend(section);
    }

    Ok(records)
}

/// Prefecture label for a bulletin data row, or None for sub-municipal
/// breakdown rows. Hokkaido and Tokyo carry their totals on differently
/// shaped rows than the other 45 prefectures.
fn npa_prefecture_label(col0: &str, col1: &str) -> Option<String> {
    let (c0, c1) = (col0.trim(), col1.trim());
    if c0 == "北海道" && c1 == "計" {
        return Some("北海道".to_string());
    }
    if c0 == "東京都" && c1.is_empty() {
        return Some("東京都".to_string());
    }
    if c1.ends_with('府') || c1.ends_with('県') {
        return Some(c1.to_string());
    }
    None
}

/// One section of the bulletin. Recognized/cleared/arrested counts sit at
/// fixed positional offsets 2/6/10 of this layout revision; shorter rows are
/// footnotes or separators and are skipped.
fn parse_npa_section(rows: &[Vec<String>], year: i32, crime_category: &str) -> Vec<ParsedRecord> {
    let mut records = Vec::new();
    for row in rows {
        if row.len() < 11 {
            continue;
        }
        let Some(prefecture_name) = npa_prefecture_label(&row[0], &row[1]) else {
            continue;
        };
        let Some(count_recognized) = parse_count(&row[2]) else {
            continue;
        };
        records.push(ParsedRecord {
            year,
            prefecture_name,
            crime_category: crime_category.to_string(),
            count_recognized,
            count_cleared: parse_count(&row[6]),
            count_arrested: parse_count(&row[10]),
        });
    }
    records
}

// =============================================================================
// Date-keyed table parser (e-Stat 第6表)
// =============================================================================

/// True for rollup rows (nationwide totals, regional police bureaus) that
/// would corrupt per-prefecture aggregation.
fn is_rollup_prefecture(cell: &str) -> bool {
    let p = cell.trim();
    p.is_empty() || p == "全国" || p == "計" || p.contains("管区")
}

fn parse_date_keyed(
    header: &[String],
    rows: &[Vec<String>],
    default_year: Option<i32>,
) -> Result<Vec<ParsedRecord>, ImportError> {
    let col = |name: &str| header.iter().position(|c| c.trim() == name);

    let date_col = col("日付");
    let pref_col = col("都道府県").or_else(|| col("prefecture"));
    let crime_col = col("罪種");
    let recognized_col = col("認知件数");
    let (Some(date_col), Some(pref_col), Some(crime_col), Some(recognized_col)) =
        (date_col, pref_col, crime_col, recognized_col)
    else {
        return Err(ImportError::UnsupportedFormat {
            header: header.to_vec(),
        });
    };
    let cleared_col = col("検挙件数");
    let arrested_col = col("検挙人員");

    let rightmost = [date_col, pref_col, crime_col, recognized_col]
        .into_iter()
        .max()
        .unwrap_or(0);

    let mut records = Vec::new();
    for row in rows {
        if row.len() <= rightmost {
            continue;
        }
        let prefecture = row[pref_col].trim();
        if is_rollup_prefecture(prefecture) {
            continue;
        }
        let year_digits: String = row[date_col].chars().take(4).collect();
        let year = if year_digits.len() == 4 && year_digits.chars().all(|c| c.is_ascii_digit()) {
            year_digits.parse().ok()
        } else {
            default_year
        };
        let Some(year) = year else {
            continue;
        };
        let Some(count_recognized) = parse_count(&row[recognized_col]) else {
            continue;
        };
        records.push(ParsedRecord {
            year,
            prefecture_name: prefecture.to_string(),
            crime_category: row[crime_col].trim().to_string(),
            count_recognized,
            count_cleared: cleared_col.and_then(|i| row.get(i)).and_then(|c| parse_count(c)),
            count_arrested: arrested_col.and_then(|i| row.get(i)).and_then(|c| parse_count(c)),
        });
    }
    Ok(records)
}

// =============================================================================
// Simple table parser (e-Stat 第3表)
// =============================================================================

/// Header text for this layout varies slightly release to release
/// (認知件数【件】, 認知件数(件), ...), so columns are located by substring
/// after normalization instead of by exact name.
fn parse_simple_table(
    header: &[String],
    rows: &[Vec<String>],
    default_year: Option<i32>,
) -> Result<Vec<ParsedRecord>, ImportError> {
    let pref_col = header
        .iter()
        .position(|c| c.contains("都道府県") || normalize_header(c).contains("prefecture"));
    let crime_col = header
        .iter()
        .position(|c| c.contains("罪種") || normalize_header(c).contains("category"));
    let recognized_col = header.iter().position(|c| c.contains("認知件数"));
    let cleared_col = header.iter().position(|c| c.contains("検挙件数"));
    let arrested_col = header.iter().position(|c| c.contains("検挙人員"));
    let year_col = header
        .iter()
        .position(|c| c.trim() == "年" || normalize_header(c).contains("year"));

    let (Some(pref_col), Some(recognized_col)) = (pref_col, recognized_col) else {
        return Err(ImportError::UnsupportedFormat {
            header: header.to_vec(),
        });
    };

    let mut records = Vec::new();
    for row in rows {
        if row.len() <= pref_col || row.len() <= recognized_col {
            continue;
        }
        let prefecture = row[pref_col].trim();
        if is_rollup_prefecture(prefecture) {
            continue;
        }
        // Some releases omit category subdivision entirely.
        let crime_category = match crime_col {
            Some(i) => row.get(i).map(|c| c.trim()).unwrap_or("").to_string(),
            None => "総数".to_string(),
        };
        let year = year_col
            .and_then(|i| row.get(i))
            .and_then(|c| {
                let t = c.trim();
                if !t.is_empty() && t.chars().all(|ch| ch.is_ascii_digit()) {
                    t.parse().ok()
                } else {
                    None
                }
            })
            .or(default_year);
        let Some(year) = year else {
            continue;
        };
        let Some(count_recognized) = parse_count(&row[recognized_col]) else {
            continue;
        };
        records.push(ParsedRecord {
            year,
            prefecture_name: prefecture.to_string(),
            crime_category,
            count_recognized,
            count_cleared: cleared_col.and_then(|i| row.get(i)).and_then(|c| parse_count(c)),
            count_arrested: arrested_col.and_then(|i| row.get(i)).and_then(|c| parse_count(c)),
        });
    }
    Ok(records)
}

// =============================================================================
// Deduplication & upsert planning
// =============================================================================

/// Resolves references and collapses records onto the natural key. Later
/// records win, matching bulletins where a later section revises an earlier
/// total. Output iterates in key order, so repeated runs over the same file
/// produce identical plans.
fn plan_upsert(records: &[ParsedRecord]) -> UpsertPlan {
    let mut skipped_unresolved = Vec::new();
    let mut resolved = 0usize;
    let mut by_key: BTreeMap<(i32, String, String), StatRow> = BTreeMap::new();

    for record in records {
        let Some(prefecture) = resolve_prefecture(&record.prefecture_name) else {
            skipped_unresolved.push(record.prefecture_name.clone());
            continue;
        };
        resolved += 1;
        let row = StatRow {
            year: record.year,
            prefecture_code: prefecture.code.to_string(),
            prefecture_name: prefecture.name.to_string(),
            crime_category: record.crime_category.clone(),
            crime_type: map_crime_type(&record.crime_category).to_string(),
            count_recognized: record.count_recognized,
            count_cleared: record.count_cleared,
            count_arrested: record.count_arrested,
            location: format!("SRID=4326;POINT({} {})", prefecture.lng, prefecture.lat),
            source: SOURCE_TAG.to_string(),
        };
        by_key.insert(
            (row.year, row.prefecture_code.clone(), row.crime_category.clone()),
            row,
        );
    }

    let skipped_duplicates = resolved - by_key.len();
    UpsertPlan {
        rows: by_key.into_values().collect(),
        skipped_unresolved,
        skipped_duplicates,
    }
}

// =============================================================================
// Storage sink (PostgreSQL)
// =============================================================================

/// Submits the whole plan as one INSERT ... ON CONFLICT DO UPDATE statement
/// against the natural-key constraint, so the batch commits or fails as a
/// unit. Key columns are never rewritten on conflict.
async fn execute_upsert(pool: &PgPool, plan: &UpsertPlan) -> Result<()> {
    if plan.rows.is_empty() {
        return Ok(());
    }

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO prefecture_stats \
         (year, prefecture_code, prefecture_name, crime_category, crime_type, \
          count_recognized, count_cleared, count_arrested, location, source) ",
    );
    qb.push_values(&plan.rows, |mut b, row| {
        b.push_bind(row.year)
            .push_bind(&row.prefecture_code)
            .push_bind(&row.prefecture_name)
            .push_bind(&row.crime_category)
            .push_bind(&row.crime_type)
            .push_bind(row.count_recognized)
            .push_bind(row.count_cleared)
            .push_bind(row.count_arrested)
            .push_bind(&row.location);
        b.push_unseparated("::geometry");
        b.push_bind(&row.source);
    });
    qb.push(
        " ON CONFLICT (year, prefecture_code, crime_category) DO UPDATE SET \
         prefecture_name = EXCLUDED.prefecture_name, \
         crime_type = EXCLUDED.crime_type, \
         count_recognized = EXCLUDED.count_recognized, \
         count_cleared = EXCLUDED.count_cleared, \
         count_arrested = EXCLUDED.count_arrested, \
         location = EXCLUDED.location, \
         source = EXCLUDED.source",
    );

    qb.build()
        .execute(pool)
        .await
        .context("failed to upsert prefecture stats batch")?;

    Ok(())
}

/// Registers a job run so imports are auditable alongside the collector and
/// parser components.
async fn create_job_run(pool: &PgPool, detail: serde_json::Value) -> Result<Uuid> {
    let job_run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO job_runs (job_run_id, component, source_id, status, detail)
        VALUES ($1, 'importer', $2, 'running', $3)
        "#,
    )
    .bind(job_run_id)
    .bind(SOURCE_TAG)
    .bind(detail)
    .execute(pool)
    .await?;
    Ok(job_run_id)
}

async fn finish_job_run(
    pool: &PgPool,
    job_run_id: Uuid,
    status: &str,
    error: Option<&str>,
    detail: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE job_runs
        SET finished_at = now(), status = $2, error = $3, detail = detail || $4
        WHERE job_run_id = $1
        "#,
    )
    .bind(job_run_id)
    .bind(status)
    .bind(error)
    .bind(detail)
    .execute(pool)
    .await?;
    Ok(())
}

// =============================================================================
// Entry point
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== Crime Stats Importer ===");
    println!("File: {}", args.file.display());
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let table = read_table(&args.file, &encoding_candidates())?;
    let layout = classify_layout(&table.text, &table.rows[0])?;
    println!("Layout: {:?}", layout);
    println!("Rows: {}", table.rows.len());

    let header = &table.rows[0];
    let data = &table.rows[1..];
    let records = match layout {
        Layout::MultiSectionReport => parse_npa_monthly(&table.rows, &args.file, args.year)?,
        Layout::DateKeyedTable => parse_date_keyed(header, data, args.year)?,
        Layout::SimpleTable => parse_simple_table(header, data, args.year)?,
    };
    println!("Parsed {} records", records.len());

    if records.is_empty() {
        println!("Nothing to import.");
        return Ok(());
    }

    let plan = plan_upsert(&records);

    for label in plan.skipped_unresolved.iter().take(5) {
        eprintln!("Warning: unknown prefecture, row skipped: {label}");
    }
    if plan.skipped_unresolved.len() > 5 {
        eprintln!("  ... and {} more", plan.skipped_unresolved.len() - 5);
    }

    println!("Sample rows:");
    for (i, row) in plan.rows.iter().take(3).enumerate() {
        println!(
            "  [{}] {} {} {} | {} -> {} | recognized={} cleared={:?} arrested={:?}",
            i + 1,
            row.year,
            row.prefecture_code,
            row.prefecture_name,
            row.crime_category,
            row.crime_type,
            row.count_recognized,
            row.count_cleared,
            row.count_arrested
        );
    }

    println!(
        "Upsert plan: {} rows / {} skipped (unresolved prefecture: {}, intra-file duplicates: {})",
        plan.rows.len(),
        plan.skipped_total(),
        plan.skipped_unresolved.len(),
        plan.skipped_duplicates
    );

    if args.dry_run {
        println!("Dry run - nothing written to the database");
        return Ok(());
    }

    let config = Config::from_env()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.db_url)
        .await
        .context("Failed to connect to database")?;

    let job_run_id = create_job_run(
        &pool,
        serde_json::json!({ "file": args.file.display().to_string() }),
    )
    .await?;

    let sample: Vec<&StatRow> = plan.rows.iter().take(3).collect();
    let detail = serde_json::json!({
        "records_parsed": records.len(),
        "rows_upserted": plan.rows.len(),
        "skipped_unresolved": plan.skipped_unresolved.len(),
        "skipped_duplicates": plan.skipped_duplicates,
        "sample": sample,
    });

    match execute_upsert(&pool, &plan).await {
        Ok(()) => {
            finish_job_run(&pool, job_run_id, "ok", None, detail).await?;
            println!("Upserted {} rows", plan.rows.len());
        }
        Err(e) => {
            finish_job_run(&pool, job_run_id, "failed", Some(&e.to_string()), detail).await?;
            return Err(e);
        }
    }

    println!("=== Import Complete ===");
    Ok(())
}

// =============================================================================
// TESTS - parsing and planning must stay deterministic
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(text: &str) -> Vec<Vec<String>> {
        rows_from_text(text)
    }

    fn record(year: i32, pref: &str, category: &str, recognized: i64) -> ParsedRecord {
        ParsedRecord {
            year,
            prefecture_name: pref.to_string(),
            crime_category: category.to_string(),
            count_recognized: recognized,
            count_cleared: None,
            count_arrested: None,
        }
    }

    // -------------------------------------------------------------------------
    // READER TESTS - encoding fallback order
    // -------------------------------------------------------------------------

    #[test]
    fn decode_prefers_utf8_and_strips_bom() {
        let bytes = "\u{feff}都道府県,認知件数\n東京都,10\n".as_bytes();
        let table = decode_table(bytes, &encoding_candidates()).unwrap();
        assert_eq!(table.rows[0][0], "都道府県");
    }

    #[test]
    fn decode_falls_back_to_shift_jis() {
        let (encoded, _, _) = SHIFT_JIS.encode("都道府県,認知件数\n大阪府,20\n");
        let table = decode_table(&encoded, &encoding_candidates()).unwrap();
        assert_eq!(table.rows[1][0], "大阪府");
    }

    #[test]
    fn decode_rejects_garbage() {
        // 0xFF is not a valid byte in either candidate encoding.
        assert!(decode_table(&[0xff, 0xff, 0xff], &encoding_candidates()).is_none());
    }

    #[test]
    fn decode_rejects_blank_only_content() {
        assert!(decode_table("\n  \n,,\n".as_bytes(), &encoding_candidates()).is_none());
    }

    #[test]
    fn reader_discards_blank_rows() {
        let table =
            decode_table("都道府県,認知件数\n,,\n   ,\n東京都,10\n".as_bytes(), &encoding_candidates())
                .unwrap();
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn count_parsing() {
        assert_eq!(parse_count("1,234"), Some(1234));
        assert_eq!(parse_count(" 42 "), Some(42));
        assert_eq!(parse_count("-"), None);
        assert_eq!(parse_count("−"), None);
        assert_eq!(parse_count("－"), None);
        assert_eq!(parse_count(""), None);
        assert_eq!(parse_count("abc"), None);
    }

    // -------------------------------------------------------------------------
    // CLASSIFIER TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn classifier_rejects_unknown_layout() {
        let text = "foo,bar\n1,2\n";
        let all = rows(text);
        let err = classify_layout(text, &all[0]).unwrap_err();
        match err {
            ImportError::UnsupportedFormat { header } => assert_eq!(header, vec!["foo", "bar"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn classifier_prefers_section_markers_over_headers() {
        let text = "第１表,月次推移\n日付,罪種\n";
        let all = rows(text);
        assert_eq!(
            classify_layout(text, &all[0]).unwrap(),
            Layout::MultiSectionReport
        );
    }

    // -------------------------------------------------------------------------
    // MULTI-SECTION REPORT TESTS
    // -------------------------------------------------------------------------

    const NPA_FIXTURE: &str = "\
第３表,刑法犯総数 都道府県別,,,,,,,,,,\n\
,,認知件数,,,検挙件数,,,,検挙人員,,\n\
都道府県,,当年,前年,増減率,,当年,前年,,,当年,前年\n\
北海道,計,1200,1100,9.1,,800,750,,,600,580\n\
北海道,札幌市,700,650,7.7,,500,470,,,380,360\n\
,青森県,300,280,7.1,,200,190,,,150,140\n\
東京都,,5000,4800,4.2,,3000,2900,,,2500,2400\n\
第６表,重要犯罪（傷害）都道府県別,,,,,,,,,,\n\
都道府県,,当年,前年,増減率,,当年,前年,,,当年,前年\n\
北海道,計,40,38,5.3,,30,29,,,20,19\n\
,大阪府,90,85,5.9,,70,66,,,50,48\n\
第６表,重要犯罪（重要犯罪総数）都道府県別,,,,,,,,,,\n\
北海道,計,999,990,0.9,,900,890,,,800,790\n";

    #[test]
    fn npa_classifies_as_multi_section() {
        let all = rows(NPA_FIXTURE);
        assert_eq!(
            classify_layout(NPA_FIXTURE, &all[0]).unwrap(),
            Layout::MultiSectionReport
        );
    }

    #[test]
    fn npa_fixture_parses_sections() {
        let all = rows(NPA_FIXTURE);
        let records = parse_npa_monthly(&all, Path::new("r08_1-1.csv"), None).unwrap();
        assert_eq!(records.len(), 5);
        assert!(records.iter().all(|r| r.year == 2026));

        let categories: Vec<&str> = records.iter().map(|r| r.crime_category.as_str()).collect();
        assert_eq!(
            categories,
            ["刑法犯総数", "刑法犯総数", "刑法犯総数", "傷害", "傷害"]
        );

        // Hokkaido total row, not the Sapporo breakdown row.
        assert_eq!(records[0].prefecture_name, "北海道");
        assert_eq!(records[0].count_recognized, 1200);
        assert_eq!(records[0].count_cleared, Some(800));
        assert_eq!(records[0].count_arrested, Some(600));

        // Tokyo carries its total on a blank-second-cell row.
        assert_eq!(records[2].prefecture_name, "東京都");
        assert_eq!(records[2].count_recognized, 5000);
    }

    #[test]
    fn npa_denylisted_section_is_ignored() {
        let all = rows(NPA_FIXTURE);
        let records = parse_npa_monthly(&all, Path::new("r08_1-1.csv"), None).unwrap();
        assert!(records.iter().all(|r| r.count_recognized != 999));
        assert!(records.iter().all(|r| r.crime_category != "重要犯罪総数"));
    }

    #[test]
    fn npa_table4_yields_theft_section() {
        let fixture = "\
第４表,窃盗犯総数 都道府県別,,,,,,,,,,\n\
都道府県,,当年,前年,増減率,,当年,前年,,,当年,前年\n\
北海道,計,500,480,4.2,,300,290,,,200,190\n\
,福岡県,800,760,5.3,,450,430,,,320,300\n";
        let records = parse_npa_monthly(&rows(fixture), Path::new("r08_1-2.csv"), None).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.crime_category == "窃盗犯"));
        assert_eq!(records[1].prefecture_name, "福岡県");
        assert_eq!(records[1].count_recognized, 800);
    }

    #[test]
    fn npa_year_from_filename() {
        assert_eq!(year_from_era_filename(Path::new("r08_1-1.csv")), Some(2026));
        assert_eq!(
            year_from_era_filename(Path::new("data/R05_3-2.csv")),
            Some(2023)
        );
        assert_eq!(year_from_era_filename(Path::new("crime_2023.csv")), None);
    }

    #[test]
    fn npa_year_override_beats_filename() {
        let all = rows(NPA_FIXTURE);
        let records = parse_npa_monthly(&all, Path::new("r08_1-1.csv"), Some(2020)).unwrap();
        assert!(records.iter().all(|r| r.year == 2020));
    }

    #[test]
    fn npa_unresolvable_year_fails() {
        let all = rows(NPA_FIXTURE);
        let err = parse_npa_monthly(&all, Path::new("bulletin.csv"), None).unwrap_err();
        assert!(matches!(err, ImportError::YearUnresolved));
    }

    #[test]
    fn npa_no_sections_fails() {
        let all = rows("月次推移,認知件数\n1月,10\n");
        let err = parse_npa_monthly(&all, Path::new("r08_1-1.csv"), None).unwrap_err();
        assert!(matches!(err, ImportError::NoSectionsFound));
    }

    #[test]
    fn npa_short_rows_are_skipped() {
        let fixture = "\
第３表,刑法犯総数,,,,,,,,,,\n\
,青森県,300\n\
,秋田県,100,90,1.0,,80,70,,,60,50\n";
        let records = parse_npa_monthly(&rows(fixture), Path::new("r08_1-1.csv"), None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].prefecture_name, "秋田県");
    }

    #[test]
    fn table_marker_detection() {
        assert!(is_table_marker("第３表"));
        assert!(is_table_marker("第10表"));
        assert!(is_table_marker("第５表"));
        assert!(!is_table_marker("第表"));
        assert!(!is_table_marker("別表"));
    }

    #[test]
    fn parenthetical_extraction() {
        assert_eq!(
            parenthetical("第６表重要犯罪（傷害）都道府県別").as_deref(),
            Some("傷害")
        );
        assert_eq!(parenthetical("第６表 (強盗) ").as_deref(), Some("強盗"));
        assert_eq!(parenthetical("第６表"), None);
    }

    // -------------------------------------------------------------------------
    // DATE-KEYED TABLE TESTS
    // -------------------------------------------------------------------------

    const DATE_KEYED_FIXTURE: &str = "\
日付,地方,area_code,都道府県,罪種,認知件数,検挙件数,検挙人員\n\
2023-04-01,関東,13000,東京都,窃盗,3000,1500,1200\n\
2023-04-01,近畿,27000,大阪府,窃盗,2000,1000,900\n\
2023-04-01,,00000,全国,窃盗,50000,25000,20000\n\
2023-04-01,関東,99999,関東管区,窃盗,9000,4500,4000\n\
bad-date,関東,13000,東京都,詐欺,100,50,40\n";

    #[test]
    fn date_keyed_parses_and_skips_rollups() {
        let all = rows(DATE_KEYED_FIXTURE);
        assert_eq!(
            classify_layout(DATE_KEYED_FIXTURE, &all[0]).unwrap(),
            Layout::DateKeyedTable
        );

        let records = parse_date_keyed(&all[0], &all[1..], None).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].prefecture_name, "東京都");
        assert_eq!(records[0].year, 2023);
        assert_eq!(records[0].crime_category, "窃盗");
        assert_eq!(records[0].count_recognized, 3000);
        assert_eq!(records[0].count_cleared, Some(1500));
        assert_eq!(records[0].count_arrested, Some(1200));
        assert_eq!(records[1].prefecture_name, "大阪府");
    }

    #[test]
    fn date_keyed_falls_back_to_default_year() {
        let all = rows(DATE_KEYED_FIXTURE);
        let records = parse_date_keyed(&all[0], &all[1..], Some(2024)).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].year, 2024);
        assert_eq!(records[2].crime_category, "詐欺");
    }

    #[test]
    fn date_keyed_missing_optional_columns_yield_none() {
        let text = "日付,都道府県,罪種,認知件数\n2023-01-01,東京都,窃盗,10\n";
        let all = rows(text);
        let records = parse_date_keyed(&all[0], &all[1..], None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count_cleared, None);
        assert_eq!(records[0].count_arrested, None);
    }

    #[test]
    fn date_keyed_missing_required_column_fails() {
        let text = "日付,罪種,検挙件数\n2023-01-01,窃盗,10\n";
        let all = rows(text);
        let err = parse_date_keyed(&all[0], &all[1..], None).unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedFormat { .. }));
    }

    #[test]
    fn date_keyed_drops_rows_without_recognized_count() {
        let text = "日付,都道府県,罪種,認知件数\n2023-01-01,東京都,窃盗,-\n2023-01-01,大阪府,窃盗,5\n";
        let all = rows(text);
        let records = parse_date_keyed(&all[0], &all[1..], None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].prefecture_name, "大阪府");
    }

    // -------------------------------------------------------------------------
    // SIMPLE TABLE TESTS
    // -------------------------------------------------------------------------

    const SIMPLE_FIXTURE: &str = "\
都道府県,認知件数【件】,検挙件数【件】,検挙人員【人】\n\
東京都,3000,1500,1200\n\
大阪府,\"2,000\",1000,900\n\
全国,50000,25000,20000\n\
アトランティス,10,5,4\n";

    #[test]
    fn simple_table_parses_with_default_year() {
        let all = rows(SIMPLE_FIXTURE);
        assert_eq!(
            classify_layout(SIMPLE_FIXTURE, &all[0]).unwrap(),
            Layout::SimpleTable
        );

        let records = parse_simple_table(&all[0], &all[1..], Some(2023)).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.crime_category == "総数"));
        assert!(records.iter().all(|r| r.year == 2023));
        assert_eq!(records[1].count_recognized, 2000);
        assert_eq!(records[1].count_cleared, Some(1000));
    }

    #[test]
    fn simple_table_without_any_year_yields_nothing() {
        let all = rows(SIMPLE_FIXTURE);
        let records = parse_simple_table(&all[0], &all[1..], None).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn simple_table_reads_year_and_category_columns() {
        let text = "年,都道府県,罪種,認知件数\n2022,京都府,詐欺,77\n";
        let all = rows(text);
        let records = parse_simple_table(&all[0], &all[1..], None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].year, 2022);
        assert_eq!(records[0].crime_category, "詐欺");
        assert_eq!(records[0].count_recognized, 77);
    }

    #[test]
    fn simple_table_matches_english_headers() {
        let text = "Prefecture,Category,Year,認知件数\n東京都,窃盗,2021,42\n";
        let all = rows(text);
        assert_eq!(classify_layout(text, &all[0]).unwrap(), Layout::SimpleTable);
        let records = parse_simple_table(&all[0], &all[1..], None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].crime_category, "窃盗");
        assert_eq!(records[0].year, 2021);
    }

    // -------------------------------------------------------------------------
    // PREFECTURE RESOLVER TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn prefecture_exact_and_alias_agree() {
        let exact = resolve_prefecture("東京都").unwrap();
        let alias = resolve_prefecture("東京").unwrap();
        assert_eq!(exact.code, "13");
        assert_eq!(alias.code, exact.code);
        assert_eq!(alias.lat, exact.lat);
        assert_eq!(alias.lng, exact.lng);
    }

    #[test]
    fn prefecture_substring_fallback() {
        // Not in the alias table; resolves through the substring pass.
        assert_eq!(resolve_prefecture("青森").unwrap().code, "02");
        // Noisy label containing the canonical name.
        assert_eq!(resolve_prefecture("沖縄県警察").unwrap().code, "47");
    }

    #[test]
    fn prefecture_unknown_is_none() {
        assert!(resolve_prefecture("Atlantis").is_none());
        assert!(resolve_prefecture("   ").is_none());
    }

    // -------------------------------------------------------------------------
    // CRIME-CATEGORY MAPPER TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn crime_type_exact_match() {
        assert_eq!(map_crime_type("傷害"), "暴行・傷害");
        assert_eq!(map_crime_type("窃盗"), "窃盗・万引き");
        assert_eq!(map_crime_type("詐欺"), "詐欺");
        assert_eq!(map_crime_type(" 殺人 "), "殺人・傷害致死");
    }

    #[test]
    fn crime_type_umbrella_fallback() {
        assert_eq!(map_crime_type("重要窃盗犯"), "窃盗・万引き");
        assert_eq!(map_crime_type("粗暴犯合計"), "暴行・傷害");
    }

    #[test]
    fn crime_type_default_bucket() {
        assert_eq!(map_crime_type("サイバー攻撃"), "その他");
        assert_eq!(map_crime_type(""), "その他");
    }

    // -------------------------------------------------------------------------
    // DEDUPLICATION & PLANNING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn plan_deduplicates_last_wins() {
        let records = vec![
            record(2023, "東京都", "窃盗", 100),
            record(2023, "東京都", "窃盗", 200),
        ];
        let plan = plan_upsert(&records);
        assert_eq!(plan.rows.len(), 1);
        assert_eq!(plan.rows[0].count_recognized, 200);
        assert_eq!(plan.skipped_duplicates, 1);
        assert!(plan.skipped_unresolved.is_empty());
    }

    #[test]
    fn plan_alias_and_official_share_a_key() {
        // The short form resolves to the same code, so the later row revises
        // the earlier one instead of creating a second key.
        let records = vec![
            record(2023, "東京", "窃盗", 100),
            record(2023, "東京都", "窃盗", 250),
        ];
        let plan = plan_upsert(&records);
        assert_eq!(plan.rows.len(), 1);
        assert_eq!(plan.rows[0].prefecture_code, "13");
        assert_eq!(plan.rows[0].prefecture_name, "東京都");
        assert_eq!(plan.rows[0].count_recognized, 250);
        assert_eq!(plan.skipped_duplicates, 1);
    }

    #[test]
    fn plan_skips_unresolved_prefectures() {
        let records = vec![
            record(2023, "アトランティス", "窃盗", 10),
            record(2023, "東京都", "窃盗", 100),
        ];
        let plan = plan_upsert(&records);
        assert_eq!(plan.rows.len(), 1);
        assert_eq!(plan.skipped_unresolved, vec!["アトランティス".to_string()]);
        assert_eq!(plan.skipped_duplicates, 0);
        assert_eq!(plan.skipped_total(), 1);
    }

    #[test]
    fn plan_rows_carry_canonical_fields() {
        let plan = plan_upsert(&[record(2023, "大阪", "傷害", 90)]);
        let row = &plan.rows[0];
        assert_eq!(row.prefecture_code, "27");
        assert_eq!(row.prefecture_name, "大阪府");
        assert_eq!(row.crime_category, "傷害");
        assert_eq!(row.crime_type, "暴行・傷害");
        assert_eq!(row.location, "SRID=4326;POINT(135.52 34.6863)");
        assert_eq!(row.source, "npa_estat");
    }

    #[test]
    fn plan_is_deterministic() {
        // Dry runs report the counts of this plan and live runs submit it
        // unchanged, so equality here is the dry-run/live guarantee.
        let all = rows(NPA_FIXTURE);
        let records = parse_npa_monthly(&all, Path::new("r08_1-1.csv"), None).unwrap();
        let first = plan_upsert(&records);
        let second = plan_upsert(&records);
        assert_eq!(first, second);

        let keys: Vec<_> = first
            .rows
            .iter()
            .map(|r| (r.year, r.prefecture_code.clone(), r.crime_category.clone()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
