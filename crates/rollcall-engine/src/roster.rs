//! Roster loading — tabular student lists to ingestion rows.
//!
//! Column names are matched case-insensitively against a small synonym set;
//! when no recognized headers are present but at least three columns exist,
//! the first three are taken as (id, name, image).

use std::path::Path;
use thiserror::Error;

/// Header synonyms, compared after lowercasing and stripping spaces and
/// underscores.
const ID_COLUMNS: [&str; 3] = ["id", "studentid", "rollno"];
const NAME_COLUMNS: [&str; 3] = ["name", "studentname", "fullname"];
const IMAGE_COLUMNS: [&str; 5] = ["image", "photo", "imagefile", "photofile", "filename"];

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("failed to read roster: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse roster: {0}")]
    Csv(#[from] csv::Error),
    #[error("could not find id/name/image columns; headers were: {0:?}")]
    MissingColumns(Vec<String>),
}

/// One roster row as read from the file, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterRow {
    pub id: String,
    pub name: String,
    /// Raw image cell: path, URL, or HYPERLINK formula.
    pub image: String,
}

/// A malformed row that could not become a [`RosterRow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRow {
    /// 1-based line number in the roster file.
    pub line: usize,
    pub reason: String,
}

/// A loaded roster: usable rows plus rows that were reported, not dropped.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub rows: Vec<RosterRow>,
    pub malformed: Vec<MalformedRow>,
}

fn normalize_key(header: &str) -> String {
    header
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Column indices for (id, name, image).
fn map_columns(headers: &[String]) -> Result<(usize, usize, usize), RosterError> {
    let mut id = None;
    let mut name = None;
    let mut image = None;

    for (idx, header) in headers.iter().enumerate() {
        let key = normalize_key(header);
        if id.is_none() && ID_COLUMNS.contains(&key.as_str()) {
            id = Some(idx);
        } else if name.is_none() && NAME_COLUMNS.contains(&key.as_str()) {
            name = Some(idx);
        } else if image.is_none() && IMAGE_COLUMNS.contains(&key.as_str()) {
            image = Some(idx);
        }
    }

    match (id, name, image) {
        (Some(i), Some(n), Some(m)) => Ok((i, n, m)),
        // Positional fallback: assume (id, name, image) ordering.
        _ if headers.len() >= 3 => Ok((0, 1, 2)),
        _ => Err(RosterError::MissingColumns(headers.to_vec())),
    }
}

/// Load a roster from a CSV file.
pub fn load_roster(path: &Path) -> Result<Roster, RosterError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let (id_idx, name_idx, image_idx) = map_columns(&headers)?;

    let mut roster = Roster::default();
    for (record_idx, record) in reader.records().enumerate() {
        // Header occupies line 1.
        let line = record_idx + 2;
        let record = record?;

        let field = |idx: usize| record.get(idx).unwrap_or("").trim().to_string();
        let (id, name, image) = (field(id_idx), field(name_idx), field(image_idx));

        if id.is_empty() || name.is_empty() || image.is_empty() {
            roster.malformed.push(MalformedRow {
                line,
                reason: "missing id, name, or image value".into(),
            });
            continue;
        }
        roster.rows.push(RosterRow { id, name, image });
    }

    tracing::info!(
        path = %path.display(),
        rows = roster.rows.len(),
        malformed = roster.malformed.len(),
        "roster loaded"
    );
    Ok(roster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_roster(contents: &str) -> (TempDir, std::path::PathBuf) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("roster.csv");
        std::fs::write(&path, contents).unwrap();
        (tmp, path)
    }

    #[test]
    fn test_standard_headers() {
        let (_tmp, path) = write_roster("id,name,image\nSTU001,John Doe,john.jpg\n");
        let roster = load_roster(&path).unwrap();
        assert_eq!(
            roster.rows,
            vec![RosterRow {
                id: "STU001".into(),
                name: "John Doe".into(),
                image: "john.jpg".into(),
            }]
        );
        assert!(roster.malformed.is_empty());
    }

    #[test]
    fn test_synonym_headers_matched_case_insensitively() {
        let (_tmp, path) = write_roster(
            "ROLL NO,NAME,PHOTO\nSTU001,John Doe,https://example.com/john.jpg\n",
        );
        let roster = load_roster(&path).unwrap();
        assert_eq!(roster.rows[0].id, "STU001");
        assert_eq!(roster.rows[0].image, "https://example.com/john.jpg");
    }

    #[test]
    fn test_positional_fallback_for_unknown_headers() {
        let (_tmp, path) = write_roster("a,b,c\nSTU001,John Doe,john.jpg\n");
        let roster = load_roster(&path).unwrap();
        assert_eq!(roster.rows.len(), 1);
        assert_eq!(roster.rows[0].name, "John Doe");
    }

    #[test]
    fn test_too_few_unknown_columns_is_an_error() {
        let (_tmp, path) = write_roster("a,b\nx,y\n");
        assert!(matches!(
            load_roster(&path),
            Err(RosterError::MissingColumns(_))
        ));
    }

    #[test]
    fn test_incomplete_rows_reported_not_dropped_silently() {
        let (_tmp, path) = write_roster(
            "id,name,image\nSTU001,John Doe,john.jpg\nSTU002,,jane.jpg\n,No Id,x.jpg\n",
        );
        let roster = load_roster(&path).unwrap();
        assert_eq!(roster.rows.len(), 1);
        assert_eq!(roster.malformed.len(), 2);
        assert_eq!(roster.malformed[0].line, 3);
        assert_eq!(roster.malformed[1].line, 4);
    }

    #[test]
    fn test_hyperlink_formula_survives_into_image_field() {
        let (_tmp, path) = write_roster(
            "id,name,photo\nSTU001,John Doe,\"=HYPERLINK(\"\"https://example.com/j.png\"\",\"\"photo\"\")\"\n",
        );
        let roster = load_roster(&path).unwrap();
        assert_eq!(
            roster.rows[0].image,
            r#"=HYPERLINK("https://example.com/j.png","photo")"#
        );
    }
}
