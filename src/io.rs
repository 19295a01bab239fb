//! Input loaders and serialization helpers.
//!
//! Covers the trait TSV (with species/trait column auto-detection), the
//! CAFE change and branch-probability tables, and the JSON writer used for
//! run metadata.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Serialize;

use crate::error::{PhylopermError, Result};

const MISSING_TOKENS: [&str; 7] = ["", "NA", "N/A", "na", "n/a", "NaN", "nan"];

const SPECIES_CANDIDATES: [&str; 7] = [
    "species",
    "taxon",
    "taxon_id",
    "tip",
    "label",
    "name",
    "scientific_name",
];

/// Loaded and validated species trait table.
#[derive(Debug, Clone)]
pub struct TraitTable {
    pub species_to_state: HashMap<String, u8>,
    pub species_column: String,
    pub trait_column: String,
    /// `"auto"` or `"manual"`.
    pub trait_column_source: String,
    pub row_count: usize,
}

/// Dense per-family change matrix in canonical branch order.
#[derive(Debug, Clone)]
pub struct FamilyMatrix {
    pub family_ids: Vec<String>,
    pub values: Vec<Vec<i64>>,
}

fn is_missing(token: &str) -> bool {
    MISSING_TOKENS.contains(&token)
}

/// Load and validate the species trait table with strict binary values.
pub fn load_trait_table(path: &Path, trait_column: Option<&str>) -> Result<TraitTable> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| PhylopermError::TraitTable(format!("cannot read {}: {e}", path.display())))?;

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.is_empty() {
        return Err(PhylopermError::TraitTable(format!(
            "trait TSV has no header: {}",
            path.display()
        )));
    }

    let header_index: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.clone(), i))
        .collect();

    let species_col = SPECIES_CANDIDATES
        .iter()
        .find_map(|cand| {
            headers
                .iter()
                .find(|h| h.to_lowercase() == *cand)
                .map(|h| h.clone())
        })
        .unwrap_or_else(|| headers[0].clone());

    let rows: Vec<csv::StringRecord> = reader
        .records()
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let cell = |row: &csv::StringRecord, col: &str| -> String {
        header_index
            .get(col)
            .and_then(|&i| row.get(i))
            .unwrap_or("")
            .trim()
            .to_string()
    };

    let (chosen_trait, source) = match trait_column {
        Some(name) => {
            if !header_index.contains_key(name) {
                return Err(PhylopermError::TraitTable(format!(
                    "trait column '{name}' not found in trait file headers: {headers:?}"
                )));
            }
            (name.to_string(), "manual".to_string())
        }
        None => {
            let mut candidates: Vec<String> = Vec::new();
            for col in &headers {
                if *col == species_col {
                    continue;
                }
                let ok = rows.iter().all(|row| {
                    let value = cell(row, col);
                    is_missing(&value) || value == "0" || value == "1"
                });
                if ok {
                    candidates.push(col.clone());
                }
            }
            match candidates.len() {
                1 => (candidates.remove(0), "auto".to_string()),
                0 => {
                    return Err(PhylopermError::TraitTable(
                        "no binary trait column detected automatically; \
                         please provide --trait-column explicitly"
                            .to_string(),
                    ))
                }
                _ => {
                    return Err(PhylopermError::TraitTable(format!(
                        "multiple binary trait columns detected ({candidates:?}); \
                         please provide --trait-column explicitly"
                    )))
                }
            }
        }
    };

    let mut species_to_state: HashMap<String, u8> = HashMap::new();
    for (offset, row) in rows.iter().enumerate() {
        let line = offset + 2;
        let species = cell(row, &species_col);
        if species.is_empty() {
            return Err(PhylopermError::TraitTable(format!(
                "empty species value at {}:{line}",
                path.display()
            )));
        }

        let raw = cell(row, &chosen_trait);
        if is_missing(&raw) {
            return Err(PhylopermError::TraitTable(format!(
                "missing trait value at {}:{line} for species '{species}' in column '{chosen_trait}'",
                path.display()
            )));
        }
        let state = match raw.as_str() {
            "0" => 0u8,
            "1" => 1u8,
            other => {
                return Err(PhylopermError::TraitTable(format!(
                    "trait value must be 0/1 at {}:{line}; got '{other}'",
                    path.display()
                )))
            }
        };

        if let Some(&prev) = species_to_state.get(&species) {
            if prev != state {
                return Err(PhylopermError::TraitTable(format!(
                    "conflicting trait assignments for species '{species}' in {}",
                    path.display()
                )));
            }
        }
        species_to_state.insert(species, state);
    }

    Ok(TraitTable {
        species_to_state,
        species_column: species_col,
        trait_column: chosen_trait,
        trait_column_source: source,
        row_count: rows.len(),
    })
}

/// Read a CAFE tab-file header, returning `(family_col, branch_cols)`.
pub fn read_cafe_header(path: &Path) -> Result<(String, Vec<String>)> {
    let file = fs::File::open(path).map_err(|e| PhylopermError::io(path, e))?;
    let mut first = String::new();
    BufReader::new(file)
        .read_line(&mut first)
        .map_err(|e| PhylopermError::io(path, e))?;
    let line = first.trim_end_matches('\n').trim_end_matches('\r');
    if line.is_empty() {
        return Err(PhylopermError::MalformedTable {
            table: "cafe".to_string(),
            path: path.to_path_buf(),
            line: 1,
            detail: "empty table".to_string(),
        });
    }

    let mut parts: Vec<String> = line.split('\t').map(|s| s.to_string()).collect();
    if let Some(first) = parts.first_mut() {
        if let Some(stripped) = first.strip_prefix('#') {
            *first = stripped.to_string();
        }
    }
    // Some CAFE tables carry a trailing blank column.
    while parts.last().map(|s| s.is_empty()).unwrap_or(false) {
        parts.pop();
    }

    let family_col = parts.remove(0);
    Ok((family_col, parts))
}

/// Map table columns to branch indices, failing on unknown branch keys.
fn map_columns(
    table: &str,
    branch_cols: &[String],
    branch_to_index: &HashMap<String, usize>,
    ignored_branch_keys: &[&str],
) -> Result<Vec<Option<usize>>> {
    let mut col_to_idx: Vec<Option<usize>> = Vec::with_capacity(branch_cols.len());
    let mut unknown: Vec<String> = Vec::new();
    for col in branch_cols {
        if let Some(&idx) = branch_to_index.get(col) {
            col_to_idx.push(Some(idx));
        } else if col.is_empty() || ignored_branch_keys.contains(&col.as_str()) {
            col_to_idx.push(None);
        } else {
            col_to_idx.push(None);
            unknown.push(col.clone());
        }
    }
    if !unknown.is_empty() {
        let extra = if unknown.len() > 6 { " ..." } else { "" };
        unknown.truncate(6);
        return Err(PhylopermError::UnknownBranchKeys {
            table: table.to_string(),
            preview: format!("{}{}", unknown.join(", "), extra),
        });
    }
    Ok(col_to_idx)
}

fn parse_delta(raw: &str, path: &Path, line: usize) -> Result<i64> {
    let v = raw.trim();
    if is_missing(v) {
        return Ok(0);
    }
    let v = v.strip_prefix('+').unwrap_or(v);
    v.parse::<i64>().map_err(|_| PhylopermError::MalformedTable {
        table: "change".to_string(),
        path: path.to_path_buf(),
        line,
        detail: format!("invalid delta value '{raw}'"),
    })
}

fn parse_probability(raw: &str) -> f64 {
    let v = raw.trim();
    if is_missing(v) {
        return f64::NAN;
    }
    v.parse::<f64>().unwrap_or(f64::NAN)
}

/// Load the branch change matrix as dense per-family vectors in branch-index
/// order. Undeclared branches default to delta 0; the root key is ignored.
pub fn load_change_matrix(
    path: &Path,
    branch_to_index: &HashMap<String, usize>,
    ignored_branch_keys: &[&str],
) -> Result<FamilyMatrix> {
    let (_, branch_cols) = read_cafe_header(path)?;
    let col_to_idx = map_columns("change", &branch_cols, branch_to_index, ignored_branch_keys)?;

    let width = branch_to_index.len();
    let file = fs::File::open(path).map_err(|e| PhylopermError::io(path, e))?;
    let reader = BufReader::new(file);

    let mut family_ids: Vec<String> = Vec::new();
    let mut values: Vec<Vec<i64>> = Vec::new();

    for (line_off, line) in reader.lines().enumerate().skip(1) {
        let line_no = line_off + 1;
        let line = line.map_err(|e| PhylopermError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.trim_end_matches('\r').split('\t').collect();

        let fam = parts[0].trim().to_string();
        if fam.is_empty() {
            return Err(PhylopermError::MalformedTable {
                table: "change".to_string(),
                path: path.to_path_buf(),
                line: line_no,
                detail: "missing family id".to_string(),
            });
        }

        let mut row = vec![0i64; width];
        for (i, map_idx) in col_to_idx.iter().enumerate() {
            let Some(idx) = map_idx else { continue };
            let raw = parts.get(i + 1).copied().unwrap_or("0");
            row[*idx] = parse_delta(raw, path, line_no)?;
        }

        family_ids.push(fam);
        values.push(row);
    }

    Ok(FamilyMatrix { family_ids, values })
}

/// Load the branch probability table as `family -> vector` in branch-index
/// order; missing cells become NaN, and families absent from the table are
/// handled by the caller.
pub fn load_probability_map(
    path: &Path,
    branch_to_index: &HashMap<String, usize>,
    ignored_branch_keys: &[&str],
) -> Result<HashMap<String, Vec<f64>>> {
    let (_, branch_cols) = read_cafe_header(path)?;
    let col_to_idx = map_columns(
        "probability",
        &branch_cols,
        branch_to_index,
        ignored_branch_keys,
    )?;

    let width = branch_to_index.len();
    let file = fs::File::open(path).map_err(|e| PhylopermError::io(path, e))?;
    let reader = BufReader::new(file);

    let mut out: HashMap<String, Vec<f64>> = HashMap::new();
    for line in reader.lines().skip(1) {
        let line = line.map_err(|e| PhylopermError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.trim_end_matches('\r').split('\t').collect();
        let fam = parts[0].trim().to_string();
        if fam.is_empty() {
            continue;
        }

        let mut vec = vec![f64::NAN; width];
        for (i, map_idx) in col_to_idx.iter().enumerate() {
            let Some(idx) = map_idx else { continue };
            let raw = parts.get(i + 1).copied().unwrap_or("N/A");
            vec[*idx] = parse_probability(raw);
        }
        out.insert(fam, vec);
    }

    Ok(out)
}

/// Serialize a value as pretty JSON with a trailing newline.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| PhylopermError::io(path, e))?;
        }
    }
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    fs::write(path, text).map_err(|e| PhylopermError::io(path, e))
}

/// SHA-256 hex digest of a file's content.
pub fn file_digest(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};
    let bytes = fs::read(path).map_err(|e| PhylopermError::io(path, e))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}
