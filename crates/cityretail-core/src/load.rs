use crate::db::DbPool;
use crate::error::{EtlError, Result};
use crate::types::{DateRecord, Entity, ProductRecord, SalesRecord, StoreRecord};

/// Write counts for one entity batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOutcome {
    pub applied: u64,
    pub skipped: u64,
}

fn batch_error(entity: Entity, err: sqlx::Error) -> EtlError {
    EtlError::ConstraintViolation {
        entity,
        source: err,
    }
}

/// Insert calendar rows that do not exist yet. DimDate is immutable once
/// created, so conflicts are skipped rather than updated. The whole batch is
/// one transaction: a mid-batch failure rolls back every row of the batch.
pub async fn load_dates(pool: &DbPool, records: &[DateRecord]) -> Result<LoadOutcome> {
    if records.is_empty() {
        return Ok(LoadOutcome::default());
    }
    let entity = Entity::DimDate;
    let mut tx = pool.begin().await.map_err(|e| batch_error(entity, e))?;
    let mut applied = 0;
    for record in records {
        let result = sqlx::query(
            r#"
                INSERT INTO dimdate
                    (dateid, fulldate, year, quarter, month, day,
                     weekdayname, weeknumber, isweekend)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (dateid) DO NOTHING
            "#,
        )
        .bind(record.dateid)
        .bind(record.fulldate)
        .bind(record.year)
        .bind(record.quarter)
        .bind(record.month)
        .bind(record.day)
        .bind(&record.weekdayname)
        .bind(record.weeknumber)
        .bind(record.isweekend)
        .execute(&mut *tx)
        .await
        .map_err(|e| batch_error(entity, e))?;
        applied += result.rows_affected();
    }
    tx.commit().await.map_err(|e| batch_error(entity, e))?;
    Ok(LoadOutcome {
        applied,
        skipped: records.len() as u64 - applied,
    })
}

/// Upsert products by business key: insert when absent, overwrite every
/// non-key attribute when present. No history is kept.
pub async fn load_products(pool: &DbPool, records: &[ProductRecord]) -> Result<LoadOutcome> {
    if records.is_empty() {
        return Ok(LoadOutcome::default());
    }
    let entity = Entity::DimProduct;
    let mut tx = pool.begin().await.map_err(|e| batch_error(entity, e))?;
    let mut applied = 0;
    for record in records {
        let result = sqlx::query(
            r#"
                INSERT INTO dimproduct
                    (productid, productname, category, subcategory, costprice, saleprice)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (productid) DO UPDATE SET
                    productname = EXCLUDED.productname,
                    category = EXCLUDED.category,
                    subcategory = EXCLUDED.subcategory,
                    costprice = EXCLUDED.costprice,
                    saleprice = EXCLUDED.saleprice
            "#,
        )
        .bind(record.productid)
        .bind(&record.productname)
        .bind(&record.category)
        .bind(&record.subcategory)
        .bind(record.costprice)
        .bind(record.saleprice)
        .execute(&mut *tx)
        .await
        .map_err(|e| batch_error(entity, e))?;
        applied += result.rows_affected();
    }
    tx.commit().await.map_err(|e| batch_error(entity, e))?;
    Ok(LoadOutcome {
        applied,
        skipped: 0,
    })
}

pub async fn load_stores(pool: &DbPool, records: &[StoreRecord]) -> Result<LoadOutcome> {
    if records.is_empty() {
        return Ok(LoadOutcome::default());
    }
    let entity = Entity::DimStore;
    let mut tx = pool.begin().await.map_err(|e| batch_error(entity, e))?;
    let mut applied = 0;
    for record in records {
        let result = sqlx::query(
            r#"
                INSERT INTO dimstore (storeid, storename, city, region)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (storeid) DO UPDATE SET
                    storename = EXCLUDED.storename,
                    city = EXCLUDED.city,
                    region = EXCLUDED.region
            "#,
        )
        .bind(record.storeid)
        .bind(&record.storename)
        .bind(&record.city)
        .bind(&record.region)
        .execute(&mut *tx)
        .await
        .map_err(|e| batch_error(entity, e))?;
        applied += result.rows_affected();
    }
    tx.commit().await.map_err(|e| batch_error(entity, e))?;
    Ok(LoadOutcome {
        applied,
        skipped: 0,
    })
}

/// Facts are insert-if-absent only: a sales id already in the warehouse is
/// silently skipped and counted, never updated. Loaded last so every foreign
/// key already resolves to a committed dimension row.
pub async fn load_sales(pool: &DbPool, records: &[SalesRecord]) -> Result<LoadOutcome> {
    if records.is_empty() {
        return Ok(LoadOutcome::default());
    }
    let entity = Entity::FactSales;
    let mut tx = pool.begin().await.map_err(|e| batch_error(entity, e))?;
    let mut applied = 0;
    for record in records {
        let result = sqlx::query(
            r#"
                INSERT INTO factsales
                    (salesid, dateid, productid, storeid, quantitysold, revenue)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (salesid) DO NOTHING
            "#,
        )
        .bind(record.salesid)
        .bind(record.dateid)
        .bind(record.productid)
        .bind(record.storeid)
        .bind(record.quantitysold)
        .bind(record.revenue)
        .execute(&mut *tx)
        .await
        .map_err(|e| batch_error(entity, e))?;
        applied += result.rows_affected();
    }
    tx.commit().await.map_err(|e| batch_error(entity, e))?;
    Ok(LoadOutcome {
        applied,
        skipped: records.len() as u64 - applied,
    })
}
