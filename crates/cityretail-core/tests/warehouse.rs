use std::env;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, OnceLock};

use anyhow::Result;
use tokio::runtime::Runtime;

use cityretail_core::config::Config;
use cityretail_core::db::{self, DbPool};
use cityretail_core::error::EtlError;
use cityretail_core::ledger::{RunLock, RunOutcome};
use cityretail_core::run::{execute_run, RunMode};
use cityretail_core::types::Entity;

// The run lock and warehouse tables are shared, so tests must not overlap.
fn db_guard() -> MutexGuard<'static, ()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn test_database_url(test_name: &str) -> Option<String> {
    match env::var("CITYRETAIL_TEST_DATABASE_URL") {
        Ok(url) => Some(url),
        Err(_) => {
            eprintln!("Skipping {test_name} because CITYRETAIL_TEST_DATABASE_URL is not set");
            None
        }
    }
}

async fn reset_warehouse(pool: &DbPool) -> Result<()> {
    db::run_migrations(pool).await?;
    sqlx::query("TRUNCATE TABLE factsales, dimdate, dimproduct, dimstore, etl_runs CASCADE")
        .execute(pool)
        .await?;
    Ok(())
}

fn write_raw_files(data_root: &Path, sale_price: f64, include_second_sale: bool) -> Result<()> {
    let raw = data_root.join("raw");
    std::fs::create_dir_all(&raw)?;
    std::fs::write(raw.join("calendar.csv"), "date\n2024-01-01\n2024-01-06\n")?;
    std::fs::write(
        raw.join("products.csv"),
        format!(
            "productid,productname,category,subcategory,costprice,saleprice\n\
             5,Gadget,Toys,Indoor,3.00,{sale_price}\n"
        ),
    )?;
    std::fs::write(
        raw.join("stores.csv"),
        "storeid,storename,city,region\n2,Beta,oslo,North\n",
    )?;
    std::fs::write(
        raw.join("cities_lookup.csv"),
        "rawcity,standardcity\noslo,Oslo\n",
    )?;
    let mut sales = String::from(
        "salesid,dateid,productid,storeid,quantitysold,revenue\n\
         100,20240101,5,2,3,29.97\n\
         ,20240101,5,2,1,9.99\n",
    );
    if include_second_sale {
        // Row 100 repeats verbatim; only 101 is genuinely new.
        sales.push_str("100,20240101,5,2,3,29.97\n101,20240106,5,2,1,9.99\n");
    }
    std::fs::write(raw.join("sales.csv"), sales)?;
    Ok(())
}

async fn fact_count(pool: &DbPool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM factsales")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[test]
fn loader_end_to_end() -> Result<()> {
    let Some(url) = test_database_url("loader_end_to_end") else {
        return Ok(());
    };
    let _guard = db_guard();
    let data_dir = tempfile::tempdir()?;
    let config = Config {
        database_url: url.clone(),
        data_root: data_dir.path().to_path_buf(),
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = db::connect(&url).await?;
        reset_warehouse(&pool).await?;
        write_raw_files(data_dir.path(), 9.99, false)?;

        // No ledger entry yet: INCREMENTAL must fall back to FULL and still
        // produce a fully populated warehouse.
        let report = execute_run(&pool, &config, RunMode::Incremental).await?;
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.requested_mode, RunMode::Incremental);
        assert_eq!(report.mode, RunMode::Full);
        assert_eq!(fact_count(&pool).await?, 1);
        // The null-key sales row is rejected, never loaded.
        assert_eq!(report.stats.factsales.rejected, 1);
        assert_eq!(report.stats.dimdate.applied, 2);

        // Re-running FULL with identical input changes nothing.
        let report = execute_run(&pool, &config, RunMode::Full).await?;
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(fact_count(&pool).await?, 1);
        assert_eq!(report.stats.factsales.applied, 0);
        assert_eq!(report.stats.factsales.skipped, 1);

        // Price change: INCREMENTAL classifies the product CHANGED and
        // updates it in place; the untouched fact row gets zero writes.
        write_raw_files(data_dir.path(), 11.99, false)?;
        let report = execute_run(&pool, &config, RunMode::Incremental).await?;
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.stats.dimproduct.applied, 1);
        assert_eq!(report.stats.factsales.applied, 0);
        assert_eq!(report.stats.factsales.unchanged, 1);
        let (price, product_rows): (f64, i64) = sqlx::query_as(
            "SELECT saleprice, (SELECT COUNT(*) FROM dimproduct) FROM dimproduct WHERE productid = 5",
        )
        .fetch_one(&pool)
        .await?;
        assert!((price - 11.99).abs() < f64::EPSILON);
        assert_eq!(product_rows, 1);

        // A repeated salesid is skipped, not duplicated; only the new row lands.
        write_raw_files(data_dir.path(), 11.99, true)?;
        let report = execute_run(&pool, &config, RunMode::Incremental).await?;
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.stats.factsales.applied, 1);
        assert_eq!(report.stats.factsales.unchanged, 1);
        assert_eq!(fact_count(&pool).await?, 2);

        // Referential completeness after loading.
        let (orphans,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM factsales f \
             WHERE NOT EXISTS (SELECT 1 FROM dimdate d WHERE d.dateid = f.dateid) \
                OR NOT EXISTS (SELECT 1 FROM dimproduct p WHERE p.productid = f.productid) \
                OR NOT EXISTS (SELECT 1 FROM dimstore s WHERE s.storeid = f.storeid)",
        )
        .fetch_one(&pool)
        .await?;
        assert_eq!(orphans, 0);

        Ok(())
    })
}

#[test]
fn dimstore_batch_rollback_and_resume() -> Result<()> {
    let Some(url) = test_database_url("dimstore_batch_rollback_and_resume") else {
        return Ok(());
    };
    let _guard = db_guard();
    let data_dir = tempfile::tempdir()?;
    let config = Config {
        database_url: url.clone(),
        data_root: data_dir.path().to_path_buf(),
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = db::connect(&url).await?;
        reset_warehouse(&pool).await?;
        write_raw_files(data_dir.path(), 9.99, false)?;

        // Forbid the region so the dimstore batch fails mid-transaction.
        sqlx::query("ALTER TABLE dimstore DROP CONSTRAINT IF EXISTS chk_region_allowed")
            .execute(&pool)
            .await?;
        sqlx::query("ALTER TABLE dimstore ADD CONSTRAINT chk_region_allowed CHECK (region <> 'North')")
            .execute(&pool)
            .await?;

        let report = execute_run(&pool, &config, RunMode::Full).await?;
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.failed_entity, Some(Entity::DimStore));

        // The dimstore batch rolled back entirely; earlier entities remain.
        let (store_rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dimstore")
            .fetch_one(&pool)
            .await?;
        assert_eq!(store_rows, 0);
        let (date_rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dimdate")
            .fetch_one(&pool)
            .await?;
        assert_eq!(date_rows, 2);
        // Facts were never attempted, so no orphaned foreign keys exist.
        assert_eq!(fact_count(&pool).await?, 0);

        sqlx::query("ALTER TABLE dimstore DROP CONSTRAINT chk_region_allowed")
            .execute(&pool)
            .await?;

        // Retry with identical sources: committed entities are skipped, the
        // failed entity is retried, and the run completes.
        let report = execute_run(&pool, &config, RunMode::Full).await?;
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.stats.dimstore.applied, 1);
        assert_eq!(fact_count(&pool).await?, 1);

        Ok(())
    })
}

#[test]
fn concurrent_run_fails_fast() -> Result<()> {
    let Some(url) = test_database_url("concurrent_run_fails_fast") else {
        return Ok(());
    };
    let _guard = db_guard();
    let data_dir = tempfile::tempdir()?;
    let config = Config {
        database_url: url.clone(),
        data_root: data_dir.path().to_path_buf(),
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = db::connect(&url).await?;
        reset_warehouse(&pool).await?;
        write_raw_files(data_dir.path(), 9.99, false)?;

        let lock = RunLock::acquire(&pool).await?;
        let err = execute_run(&pool, &config, RunMode::Full)
            .await
            .expect_err("run should fail while the lock is held");
        assert!(matches!(err, EtlError::ConcurrentRunDetected));

        // The blocked run never opened a ledger entry or touched the warehouse.
        let (runs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM etl_runs")
            .fetch_one(&pool)
            .await?;
        assert_eq!(runs, 0);
        assert_eq!(fact_count(&pool).await?, 0);

        lock.release().await?;
        let report = execute_run(&pool, &config, RunMode::Full).await?;
        assert_eq!(report.outcome, RunOutcome::Succeeded);

        Ok(())
    })
}
