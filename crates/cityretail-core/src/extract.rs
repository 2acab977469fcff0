use std::collections::HashMap;
use std::path::Path;

use crate::error::{EtlError, Result};

/// A required source column: the canonical (lowercase) header plus accepted
/// aliases seen in older extracts.
#[derive(Debug, Clone, Copy)]
pub struct SourceColumn {
    pub canonical: &'static str,
    pub aliases: &'static [&'static str],
}

const fn col(canonical: &'static str) -> SourceColumn {
    SourceColumn {
        canonical,
        aliases: &[],
    }
}

/// Expected column set for one source file. Header matching is
/// case-insensitive; extra columns in the file are ignored.
#[derive(Debug, Clone, Copy)]
pub struct SourceSchema {
    pub name: &'static str,
    pub columns: &'static [SourceColumn],
}

pub const CALENDAR_SCHEMA: SourceSchema = SourceSchema {
    name: "calendar",
    columns: &[SourceColumn {
        canonical: "date",
        aliases: &["fulldate"],
    }],
};

pub const PRODUCTS_SCHEMA: SourceSchema = SourceSchema {
    name: "products",
    columns: &[
        col("productid"),
        col("productname"),
        col("category"),
        col("subcategory"),
        col("costprice"),
        col("saleprice"),
    ],
};

pub const STORES_SCHEMA: SourceSchema = SourceSchema {
    name: "stores",
    columns: &[
        col("storeid"),
        col("storename"),
        col("city"),
        col("region"),
    ],
};

pub const SALES_SCHEMA: SourceSchema = SourceSchema {
    name: "sales",
    columns: &[
        col("salesid"),
        col("dateid"),
        col("productid"),
        col("storeid"),
        SourceColumn {
            canonical: "quantitysold",
            aliases: &["qtysold"],
        },
        col("revenue"),
    ],
};

pub const CITIES_LOOKUP_SCHEMA: SourceSchema = SourceSchema {
    name: "cities_lookup",
    columns: &[col("rawcity"), col("standardcity")],
};

/// One raw row: cells aligned with the schema's column order, `None` where the
/// cell was empty. `line` is the 1-based line in the source file, kept for
/// rejection reporting.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub line: u64,
    cells: Vec<Option<String>>,
}

impl RawRow {
    /// Cell for the schema column at `idx`, trimmed; empty cells are `None`.
    pub fn get(&self, idx: usize) -> Option<&str> {
        self.cells.get(idx).and_then(|c| c.as_deref())
    }
}

#[derive(Debug)]
pub struct RawTable {
    pub schema: SourceSchema,
    pub rows: Vec<RawRow>,
}

/// Read one source file against its expected schema. Pure read: malformed
/// individual rows pass through untouched for the cleaner to judge, but a
/// missing file or an unparsable CSV structure aborts this source.
pub fn read_source(path: &Path, schema: SourceSchema) -> Result<RawTable> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| EtlError::UnreadableSource {
            source_name: schema.name,
            message: err.to_string(),
        })?;

    let headers = reader
        .headers()
        .map_err(|err| EtlError::UnreadableSource {
            source_name: schema.name,
            message: err.to_string(),
        })?
        .clone();

    let header_index: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.trim().to_ascii_lowercase(), idx))
        .collect();

    let mut positions = Vec::with_capacity(schema.columns.len());
    let mut missing = Vec::new();
    for column in schema.columns {
        let found = header_index.get(column.canonical).copied().or_else(|| {
            column
                .aliases
                .iter()
                .find_map(|alias| header_index.get(*alias).copied())
        });
        match found {
            Some(idx) => positions.push(idx),
            None => missing.push(column.canonical.to_string()),
        }
    }
    if !missing.is_empty() {
        return Err(EtlError::SchemaMismatch {
            source_name: schema.name,
            missing,
        });
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| EtlError::UnreadableSource {
            source_name: schema.name,
            message: err.to_string(),
        })?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        let cells = positions
            .iter()
            .map(|&idx| {
                record
                    .get(idx)
                    .map(str::trim)
                    .filter(|cell| !cell.is_empty())
                    .map(str::to_string)
            })
            .collect();
        rows.push(RawRow { line, cells });
    }

    Ok(RawTable { schema, rows })
}

/// Content fingerprint of a raw file, recorded in the run ledger so a later
/// run can tell whether the cleaned artifacts derived from it are stale.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let contents = std::fs::read(path)?;
    Ok(blake3::hash(&contents).to_hex().to_string())
}
