use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{de::DeserializeOwned, Serialize};

use crate::config;
use crate::error::{EtlError, Result};
use crate::extract::RawTable;
use crate::types::{DateRecord, ProductRecord, SalesRecord, StoreRecord};

/// Why one source row was excluded from the load. Row-level rejections are
/// data, not errors: they are counted in run statistics and never abort a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NullKey,
    TypeCoercionFailed,
    OutOfRange,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RejectReason::NullKey => "NullKey",
            RejectReason::TypeCoercionFailed => "TypeCoercionFailed",
            RejectReason::OutOfRange => "OutOfRange",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct RejectedRow {
    pub line: u64,
    pub reason: RejectReason,
    pub detail: String,
}

/// Output of one entity's cleaning pass: typed records plus the rows that did
/// not make it. `superseded` counts rows overridden by a later row with the
/// same business key (last-row-wins by file order).
#[derive(Debug)]
pub struct Cleaned<T> {
    pub records: Vec<T>,
    pub rejects: Vec<RejectedRow>,
    pub superseded: usize,
}

fn reject(line: u64, reason: RejectReason, detail: impl Into<String>) -> RejectedRow {
    RejectedRow {
        line,
        reason,
        detail: detail.into(),
    }
}

fn parse_i64(cell: &str, column: &str, line: u64) -> std::result::Result<i64, RejectedRow> {
    cell.parse::<i64>().map_err(|_| {
        reject(
            line,
            RejectReason::TypeCoercionFailed,
            format!("{column}: not an integer: {cell:?}"),
        )
    })
}

fn parse_i32(cell: &str, column: &str, line: u64) -> std::result::Result<i32, RejectedRow> {
    parse_i64(cell, column, line).and_then(|v| {
        i32::try_from(v).map_err(|_| {
            reject(
                line,
                RejectReason::OutOfRange,
                format!("{column}: out of range: {cell:?}"),
            )
        })
    })
}

fn parse_money(cell: &str, column: &str, line: u64) -> std::result::Result<f64, RejectedRow> {
    let value = cell.parse::<f64>().map_err(|_| {
        reject(
            line,
            RejectReason::TypeCoercionFailed,
            format!("{column}: not a number: {cell:?}"),
        )
    })?;
    if !value.is_finite() || value < 0.0 {
        return Err(reject(
            line,
            RejectReason::OutOfRange,
            format!("{column}: negative or non-finite: {cell:?}"),
        ));
    }
    Ok(value)
}

fn parse_date(cell: &str, line: u64) -> std::result::Result<NaiveDate, RejectedRow> {
    NaiveDate::parse_from_str(cell, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(cell, "%m/%d/%Y"))
        .map_err(|_| {
            reject(
                line,
                RejectReason::TypeCoercionFailed,
                format!("date: unparsable: {cell:?}"),
            )
        })
}

/// Keep only the last row per business key, preserving first-seen order.
fn dedup_last_wins<T, K, F>(records: Vec<T>, key_of: F) -> (Vec<T>, usize)
where
    K: std::hash::Hash + Eq,
    F: Fn(&T) -> K,
{
    let mut index: HashMap<K, usize> = HashMap::with_capacity(records.len());
    let mut kept: Vec<Option<T>> = Vec::with_capacity(records.len());
    let mut superseded = 0;
    for record in records {
        match index.entry(key_of(&record)) {
            std::collections::hash_map::Entry::Occupied(slot) => {
                kept[*slot.get()] = Some(record);
                superseded += 1;
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(kept.len());
                kept.push(Some(record));
            }
        }
    }
    (kept.into_iter().flatten().collect(), superseded)
}

/// Derive the full calendar row from a parsed date. Deterministic: weekend is
/// Saturday/Sunday, week numbers follow ISO-8601.
pub fn derive_date_record(date: NaiveDate) -> DateRecord {
    let weekday = date.weekday();
    DateRecord {
        dateid: date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32,
        fulldate: date,
        year: date.year(),
        quarter: (date.month0() / 3 + 1) as i16,
        month: date.month() as i16,
        day: date.day() as i16,
        weekdayname: format!("{weekday}"),
        weeknumber: date.iso_week().week() as i16,
        isweekend: matches!(weekday, Weekday::Sat | Weekday::Sun),
    }
}

pub fn clean_calendar(raw: &RawTable) -> Cleaned<DateRecord> {
    let mut records = Vec::with_capacity(raw.rows.len());
    let mut rejects = Vec::new();
    for row in &raw.rows {
        let Some(cell) = row.get(0) else {
            rejects.push(reject(row.line, RejectReason::NullKey, "date: missing"));
            continue;
        };
        match parse_date(cell, row.line) {
            Ok(date) => records.push(derive_date_record(date)),
            Err(rejected) => rejects.push(rejected),
        }
    }
    let (records, superseded) = dedup_last_wins(records, |r| r.dateid);
    Cleaned {
        records,
        rejects,
        superseded,
    }
}

pub fn clean_products(raw: &RawTable) -> Cleaned<ProductRecord> {
    let mut records = Vec::with_capacity(raw.rows.len());
    let mut rejects = Vec::new();
    for row in &raw.rows {
        let Some(id_cell) = row.get(0) else {
            rejects.push(reject(row.line, RejectReason::NullKey, "productid: missing"));
            continue;
        };
        let parsed = parse_i32(id_cell, "productid", row.line).and_then(|productid| {
            Ok(ProductRecord {
                productid,
                productname: row.get(1).unwrap_or_default().to_string(),
                category: row.get(2).unwrap_or_default().to_string(),
                subcategory: row.get(3).unwrap_or_default().to_string(),
                costprice: parse_money(row.get(4).unwrap_or(""), "costprice", row.line)?,
                saleprice: parse_money(row.get(5).unwrap_or(""), "saleprice", row.line)?,
            })
        });
        match parsed {
            Ok(record) => records.push(record),
            Err(rejected) => rejects.push(rejected),
        }
    }
    let (records, superseded) = dedup_last_wins(records, |r| r.productid);
    Cleaned {
        records,
        rejects,
        superseded,
    }
}

/// City-name standardization map built from the optional lookup file.
#[derive(Debug, Default)]
pub struct CityLookup {
    map: HashMap<String, String>,
}

impl CityLookup {
    pub fn from_table(raw: &RawTable) -> Self {
        let mut map = HashMap::with_capacity(raw.rows.len());
        for row in &raw.rows {
            if let (Some(raw_city), Some(standard)) = (row.get(0), row.get(1)) {
                map.insert(raw_city.to_ascii_lowercase(), standard.to_string());
            }
        }
        Self { map }
    }

    pub fn standardize<'a>(&'a self, city: &'a str) -> Option<&'a str> {
        self.map.get(&city.to_ascii_lowercase()).map(String::as_str)
    }
}

pub fn clean_stores(raw: &RawTable, lookup: Option<&CityLookup>) -> Cleaned<StoreRecord> {
    let mut records = Vec::with_capacity(raw.rows.len());
    let mut rejects = Vec::new();
    let mut unmapped = 0usize;
    for row in &raw.rows {
        let Some(id_cell) = row.get(0) else {
            rejects.push(reject(row.line, RejectReason::NullKey, "storeid: missing"));
            continue;
        };
        let storeid = match parse_i32(id_cell, "storeid", row.line) {
            Ok(id) => id,
            Err(rejected) => {
                rejects.push(rejected);
                continue;
            }
        };
        let raw_city = row.get(2).unwrap_or_default();
        let city = match lookup {
            Some(lookup) => match lookup.standardize(raw_city) {
                Some(standard) => standard.to_string(),
                None => {
                    // Unmapped cities keep their raw spelling rather than being dropped.
                    if !raw_city.is_empty() {
                        unmapped += 1;
                    }
                    raw_city.to_string()
                }
            },
            None => raw_city.to_string(),
        };
        records.push(StoreRecord {
            storeid,
            storename: row.get(1).unwrap_or_default().to_string(),
            city,
            region: row.get(3).unwrap_or_default().to_string(),
        });
    }
    if unmapped > 0 {
        tracing::warn!(unmapped, "some store cities could not be standardized");
    }
    let (records, superseded) = dedup_last_wins(records, |r| r.storeid);
    Cleaned {
        records,
        rejects,
        superseded,
    }
}

pub fn clean_sales(raw: &RawTable) -> Cleaned<SalesRecord> {
    let mut records = Vec::with_capacity(raw.rows.len());
    let mut rejects = Vec::new();
    for row in &raw.rows {
        let Some(id_cell) = row.get(0) else {
            rejects.push(reject(row.line, RejectReason::NullKey, "salesid: missing"));
            continue;
        };
        let parsed = parse_i64(id_cell, "salesid", row.line).and_then(|salesid| {
            let quantity = parse_i32(row.get(4).unwrap_or(""), "quantitysold", row.line)?;
            if quantity < 0 {
                return Err(reject(
                    row.line,
                    RejectReason::OutOfRange,
                    format!("quantitysold: negative: {quantity}"),
                ));
            }
            Ok(SalesRecord {
                salesid,
                dateid: parse_i32(row.get(1).unwrap_or_default(), "dateid", row.line)?,
                productid: parse_i32(row.get(2).unwrap_or_default(), "productid", row.line)?,
                storeid: parse_i32(row.get(3).unwrap_or_default(), "storeid", row.line)?,
                quantitysold: quantity,
                revenue: parse_money(row.get(5).unwrap_or(""), "revenue", row.line)?,
            })
        });
        match parsed {
            Ok(record) => records.push(record),
            Err(rejected) => rejects.push(rejected),
        }
    }
    let (records, superseded) = dedup_last_wins(records, |r| r.salesid);
    Cleaned {
        records,
        rejects,
        superseded,
    }
}

/// Cleaned record sets for all four entities, ready for change detection and
/// loading, and for persistence as cleaned CSV artifacts.
#[derive(Debug)]
pub struct CleanedBundle {
    pub dates: Vec<DateRecord>,
    pub products: Vec<ProductRecord>,
    pub stores: Vec<StoreRecord>,
    pub sales: Vec<SalesRecord>,
}

fn write_artifact<T: Serialize>(dir: &Path, file_name: &str, records: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(config::cleaned_path(dir, file_name))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

fn read_artifact<T: DeserializeOwned>(dir: &Path, file_name: &str) -> Result<Vec<T>> {
    let path = config::cleaned_path(dir, file_name);
    let mut reader = csv::Reader::from_path(&path).map_err(|err| EtlError::UnreadableSource {
        source_name: "cleaned artifacts",
        message: format!("{}: {err}", path.display()),
    })?;
    let mut records = Vec::new();
    for record in reader.deserialize() {
        records.push(record?);
    }
    Ok(records)
}

/// Persist the cleaned record sets so a later FULL run can skip re-derivation.
pub fn write_cleaned_artifacts(dir: &Path, bundle: &CleanedBundle) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    write_artifact(dir, config::CALENDAR_FILE, &bundle.dates)?;
    write_artifact(dir, config::PRODUCTS_FILE, &bundle.products)?;
    write_artifact(dir, config::STORES_FILE, &bundle.stores)?;
    write_artifact(dir, config::SALES_FILE, &bundle.sales)?;
    Ok(())
}

pub fn cleaned_artifacts_exist(dir: &Path) -> bool {
    [
        config::CALENDAR_FILE,
        config::PRODUCTS_FILE,
        config::STORES_FILE,
        config::SALES_FILE,
    ]
    .iter()
    .all(|file| config::cleaned_path(dir, file).is_file())
}

pub fn read_cleaned_artifacts(dir: &Path) -> Result<CleanedBundle> {
    Ok(CleanedBundle {
        dates: read_artifact(dir, config::CALENDAR_FILE)?,
        products: read_artifact(dir, config::PRODUCTS_FILE)?,
        stores: read_artifact(dir, config::STORES_FILE)?,
        sales: read_artifact(dir, config::SALES_FILE)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{
        read_source, CALENDAR_SCHEMA, CITIES_LOOKUP_SCHEMA, PRODUCTS_SCHEMA, SALES_SCHEMA,
        STORES_SCHEMA,
    };
    use std::io::Write;

    fn table(contents: &str, schema: crate::extract::SourceSchema) -> RawTable {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(contents.as_bytes()).expect("write temp file");
        read_source(file.path(), schema).expect("read source")
    }

    #[test]
    fn calendar_derivation_matches_iso_rules() {
        let raw = table("date\n2024-01-06\n", CALENDAR_SCHEMA);
        let cleaned = clean_calendar(&raw);
        let record = &cleaned.records[0];
        assert_eq!(record.dateid, 20240106);
        assert_eq!(record.year, 2024);
        assert_eq!(record.quarter, 1);
        assert_eq!(record.weekdayname, "Sat");
        assert_eq!(record.weeknumber, 1);
        assert!(record.isweekend);
    }

    #[test]
    fn iso_week_of_january_first_can_belong_to_prior_year() {
        // 2021-01-01 is a Friday in ISO week 53 of 2020.
        let record = derive_date_record(NaiveDate::from_ymd_opt(2021, 1, 1).unwrap());
        assert_eq!(record.weeknumber, 53);
        assert!(!record.isweekend);
    }

    #[test]
    fn missing_business_key_is_always_rejected() {
        let raw = table(
            "productid,productname,category,subcategory,costprice,saleprice\n\
             ,Widget,Toys,Outdoor,1.00,2.00\n\
             5,Gadget,Toys,Indoor,3.00,9.99\n",
            PRODUCTS_SCHEMA,
        );
        let cleaned = clean_products(&raw);
        assert_eq!(cleaned.records.len(), 1);
        assert_eq!(cleaned.rejects.len(), 1);
        assert_eq!(cleaned.rejects[0].reason, RejectReason::NullKey);
        assert_eq!(cleaned.records[0].productid, 5);
    }

    #[test]
    fn failed_numeric_coercion_rejects_the_row() {
        let raw = table(
            "salesid,dateid,productid,storeid,quantitysold,revenue\n\
             100,20240101,5,2,three,29.97\n",
            SALES_SCHEMA,
        );
        let cleaned = clean_sales(&raw);
        assert!(cleaned.records.is_empty());
        assert_eq!(cleaned.rejects[0].reason, RejectReason::TypeCoercionFailed);
    }

    #[test]
    fn negative_revenue_is_out_of_range() {
        let raw = table(
            "salesid,dateid,productid,storeid,quantitysold,revenue\n\
             100,20240101,5,2,3,-29.97\n",
            SALES_SCHEMA,
        );
        let cleaned = clean_sales(&raw);
        assert!(cleaned.records.is_empty());
        assert_eq!(cleaned.rejects[0].reason, RejectReason::OutOfRange);
    }

    #[test]
    fn duplicate_business_key_last_row_wins() {
        let raw = table(
            "productid,productname,category,subcategory,costprice,saleprice\n\
             5,Gadget,Toys,Indoor,3.00,9.99\n\
             5,Gadget,Toys,Indoor,3.00,11.99\n",
            PRODUCTS_SCHEMA,
        );
        let cleaned = clean_products(&raw);
        assert_eq!(cleaned.records.len(), 1);
        assert_eq!(cleaned.superseded, 1);
        assert!(cleaned.rejects.is_empty());
        assert!((cleaned.records[0].saleprice - 11.99).abs() < f64::EPSILON);
    }

    #[test]
    fn store_cities_are_standardized_via_lookup() {
        let stores = table(
            "storeid,storename,city,region\n\
             1,Alpha,OSLO,North\n\
             2,Beta,Atlantis,South\n",
            STORES_SCHEMA,
        );
        let lookup_table = table("rawcity,standardcity\noslo,Oslo\n", CITIES_LOOKUP_SCHEMA);
        let lookup = CityLookup::from_table(&lookup_table);
        let cleaned = clean_stores(&stores, Some(&lookup));
        assert_eq!(cleaned.records[0].city, "Oslo");
        // Unmapped city keeps its raw spelling.
        assert_eq!(cleaned.records[1].city, "Atlantis");
    }

    #[test]
    fn cleaned_artifacts_can_be_reloaded() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let bundle = CleanedBundle {
            dates: vec![derive_date_record(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            )],
            products: vec![ProductRecord {
                productid: 5,
                productname: "Gadget".into(),
                category: "Toys".into(),
                subcategory: "Indoor".into(),
                costprice: 3.0,
                saleprice: 9.99,
            }],
            stores: vec![StoreRecord {
                storeid: 2,
                storename: "Beta".into(),
                city: "Oslo".into(),
                region: "North".into(),
            }],
            sales: vec![SalesRecord {
                salesid: 100,
                dateid: 20240101,
                productid: 5,
                storeid: 2,
                quantitysold: 3,
                revenue: 29.97,
            }],
        };
        write_cleaned_artifacts(dir.path(), &bundle).expect("write artifacts");
        assert!(cleaned_artifacts_exist(dir.path()));
        let reloaded = read_cleaned_artifacts(dir.path()).expect("read artifacts");
        assert_eq!(reloaded.dates, bundle.dates);
        assert_eq!(reloaded.sales, bundle.sales);
    }
}
