use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use crate::db::DbPool;
use crate::error::Result;
use crate::types::{DateRecord, ProductRecord, SalesRecord, StoreRecord};

/// Result of classifying one entity's cleaned records against the warehouse.
/// `to_apply` holds the records the loader must write; unchanged records are
/// dropped here so the loader issues zero writes for them.
#[derive(Debug)]
pub struct ChangeSet<T> {
    pub to_apply: Vec<T>,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
}

impl<T> ChangeSet<T> {
    /// FULL/FORCE mode: every record is an upsert target. Idempotent because
    /// the loader writes are keyed by business key.
    pub fn take_all(records: Vec<T>) -> Self {
        let new = records.len();
        Self {
            to_apply: records,
            new,
            changed: 0,
            unchanged: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_apply.is_empty()
    }
}

/// Classify cleaned dimension records against the stored rows fetched for
/// their business keys. Comparison is by attribute value, never by a stored
/// hash. `immutable` marks dimensions whose rows never change once created
/// (dimdate): present keys are UNCHANGED regardless of attributes.
pub fn classify_dimension<T, K, F>(
    cleaned: Vec<T>,
    stored: &HashMap<K, T>,
    key_of: F,
    immutable: bool,
) -> ChangeSet<T>
where
    T: PartialEq,
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut to_apply = Vec::new();
    let mut new = 0;
    let mut changed = 0;
    let mut unchanged = 0;
    for record in cleaned {
        match stored.get(&key_of(&record)) {
            None => {
                new += 1;
                to_apply.push(record);
            }
            Some(_) if immutable => unchanged += 1,
            Some(existing) if *existing == record => unchanged += 1,
            Some(_) => {
                changed += 1;
                to_apply.push(record);
            }
        }
    }
    ChangeSet {
        to_apply,
        new,
        changed,
        unchanged,
    }
}

/// Classify fact records: an existing sales id is never updated, only skipped.
pub fn classify_facts(cleaned: Vec<SalesRecord>, existing_ids: &HashSet<i64>) -> ChangeSet<SalesRecord> {
    let mut to_apply = Vec::new();
    let mut unchanged = 0;
    for record in cleaned {
        if existing_ids.contains(&record.salesid) {
            unchanged += 1;
        } else {
            to_apply.push(record);
        }
    }
    let new = to_apply.len();
    ChangeSet {
        to_apply,
        new,
        changed: 0,
        unchanged,
    }
}

// The fetches below are bounded by the candidate business keys (`= ANY($1)`),
// so an incremental run reads rows proportional to the source batch, never to
// the warehouse size.

pub async fn fetch_stored_dates(pool: &DbPool, keys: &[i32]) -> Result<HashMap<i32, DateRecord>> {
    if keys.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<DateRecord> = sqlx::query_as(
        r#"
            SELECT dateid, fulldate, year, quarter, month, day,
                   weekdayname, weeknumber, isweekend
            FROM dimdate
            WHERE dateid = ANY($1)
        "#,
    )
    .bind(keys)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| (r.dateid, r)).collect())
}

pub async fn fetch_stored_products(
    pool: &DbPool,
    keys: &[i32],
) -> Result<HashMap<i32, ProductRecord>> {
    if keys.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<ProductRecord> = sqlx::query_as(
        r#"
            SELECT productid, productname, category, subcategory, costprice, saleprice
            FROM dimproduct
            WHERE productid = ANY($1)
        "#,
    )
    .bind(keys)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| (r.productid, r)).collect())
}

pub async fn fetch_stored_stores(
    pool: &DbPool,
    keys: &[i32],
) -> Result<HashMap<i32, StoreRecord>> {
    if keys.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<StoreRecord> = sqlx::query_as(
        r#"
            SELECT storeid, storename, city, region
            FROM dimstore
            WHERE storeid = ANY($1)
        "#,
    )
    .bind(keys)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| (r.storeid, r)).collect())
}

pub async fn fetch_existing_sales_ids(pool: &DbPool, keys: &[i64]) -> Result<HashSet<i64>> {
    if keys.is_empty() {
        return Ok(HashSet::new());
    }
    let rows: Vec<(i64,)> =
        sqlx::query_as(r#"SELECT salesid FROM factsales WHERE salesid = ANY($1)"#)
            .bind(keys)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
