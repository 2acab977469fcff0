use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clean::{self, CityLookup, Cleaned, CleanedBundle};
use crate::config::{self, Config};
use crate::db::DbPool;
use crate::detect::{self, ChangeSet};
use crate::error::{EtlError, Result};
use crate::extract;
use crate::ledger::{self, CommitStatus, EntityStatus, LedgerEntry, RunLock, RunOutcome};
use crate::load;
use crate::types::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Default: reuse cleaned artifacts when they are current, then load everything.
    Full,
    /// Re-extract and re-clean unconditionally, then load everything.
    Force,
    /// Narrow the load to NEW/CHANGED records via the change detector.
    Incremental,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Full => "FULL",
            RunMode::Force => "FORCE",
            RunMode::Incremental => "INCREMENTAL",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Extracting,
    Cleaning,
    DetectingChanges,
    LoadingDims,
    LoadingFacts,
    Finalizing,
    Succeeded,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "Idle",
            RunState::Extracting => "Extracting",
            RunState::Cleaning => "Cleaning",
            RunState::DetectingChanges => "DetectingChanges",
            RunState::LoadingDims => "LoadingDims",
            RunState::LoadingFacts => "LoadingFacts",
            RunState::Finalizing => "Finalizing",
            RunState::Succeeded => "Succeeded",
            RunState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EntityStats {
    pub extracted: usize,
    pub cleaned: usize,
    pub rejected: usize,
    pub superseded: usize,
    pub unchanged: usize,
    pub applied: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunStats {
    pub dimdate: EntityStats,
    pub dimproduct: EntityStats,
    pub dimstore: EntityStats,
    pub factsales: EntityStats,
}

impl RunStats {
    pub fn entity(&self, entity: Entity) -> &EntityStats {
        match entity {
            Entity::DimDate => &self.dimdate,
            Entity::DimProduct => &self.dimproduct,
            Entity::DimStore => &self.dimstore,
            Entity::FactSales => &self.factsales,
        }
    }

    fn entity_mut(&mut self, entity: Entity) -> &mut EntityStats {
        match entity {
            Entity::DimDate => &mut self.dimdate,
            Entity::DimProduct => &mut self.dimproduct,
            Entity::DimStore => &mut self.dimstore,
            Entity::FactSales => &mut self.factsales,
        }
    }
}

/// Outcome of one run, returned to the CLI for summary rendering and exit
/// code mapping. A failed load stage is reported here, not raised: the ledger
/// entry is already finalized by the time the caller sees this.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub requested_mode: RunMode,
    pub mode: RunMode,
    pub outcome: RunOutcome,
    pub stats: RunStats,
    pub failed_entity: Option<Entity>,
    pub error: Option<String>,
}

/// Everything one run needs, constructed once at entry and passed explicitly
/// through the stages. Never global.
struct RunContext<'a> {
    pool: &'a DbPool,
    config: &'a Config,
    run_id: Uuid,
    mode: RunMode,
    state: RunState,
    stats: RunStats,
    entity_status: Vec<EntityStatus>,
    fingerprints: BTreeMap<String, String>,
    resume_skip: HashSet<Entity>,
    prior_success: Option<LedgerEntry>,
}

impl RunContext<'_> {
    fn transition(&mut self, next: RunState) {
        info!(run_id = %self.run_id, from = %self.state, to = %next, "run state transition");
        self.state = next;
    }

    fn set_status(&mut self, entity: Entity, status: CommitStatus) {
        if let Some(slot) = self.entity_status.iter_mut().find(|s| s.entity == entity) {
            slot.status = status;
        }
    }
}

/// Mode resolution happens once at entry. INCREMENTAL without a prior
/// successful run cannot bound its window; the documented recovery is a
/// fallback to FULL, not a hard error.
fn resolve_mode(requested: RunMode, has_prior_success: bool) -> RunMode {
    match requested {
        RunMode::Incremental if !has_prior_success => {
            warn!("{}; falling back to FULL", EtlError::LedgerUnavailable);
            RunMode::Full
        }
        other => other,
    }
}

/// Entities to skip because the immediately preceding run failed after
/// committing them, and the source files are byte-identical to that run's.
fn resume_entities(
    last_finished: Option<&LedgerEntry>,
    current_fingerprints: &BTreeMap<String, String>,
) -> HashSet<Entity> {
    let Some(entry) = last_finished else {
        return HashSet::new();
    };
    if entry.outcome != RunOutcome::Failed {
        return HashSet::new();
    }
    let same_sources = entry
        .source_fingerprints
        .as_ref()
        .is_some_and(|prev| prev == current_fingerprints);
    if !same_sources {
        return HashSet::new();
    }
    entry.committed_entities().into_iter().collect()
}

/// Execute one warehouse load under the exclusive run lock.
pub async fn execute_run(pool: &DbPool, config: &Config, requested: RunMode) -> Result<RunReport> {
    let lock = RunLock::acquire(pool).await?;
    let result = execute_run_locked(pool, config, requested).await;
    lock.release().await?;
    result
}

async fn execute_run_locked(
    pool: &DbPool,
    config: &Config,
    requested: RunMode,
) -> Result<RunReport> {
    let prior_success = ledger::last_successful_run(pool).await?;
    let mode = resolve_mode(requested, prior_success.is_some());
    let run_id = Uuid::new_v4();
    info!(%run_id, requested = %requested, resolved = %mode, "starting warehouse load");

    let fingerprints = fingerprint_sources(config)?;
    let last_finished = ledger::last_finished_run(pool).await?;
    let resume_skip = resume_entities(last_finished.as_ref(), &fingerprints);
    if !resume_skip.is_empty() {
        info!(
            entities = ?resume_skip,
            "previous run failed after committing these entities; skipping them"
        );
    }

    ledger::open_run(pool, run_id, mode.as_str()).await?;

    let mut ctx = RunContext {
        pool,
        config,
        run_id,
        mode,
        state: RunState::Idle,
        stats: RunStats::default(),
        entity_status: Entity::LOAD_ORDER
            .iter()
            .map(|&entity| EntityStatus {
                entity,
                status: CommitStatus::Pending,
            })
            .collect(),
        fingerprints,
        resume_skip,
        prior_success,
    };

    let staged = run_stages(&mut ctx).await;

    ctx.transition(RunState::Finalizing);
    let outcome = match &staged {
        Ok(()) => RunOutcome::Succeeded,
        Err(_) => RunOutcome::Failed,
    };
    ledger::finalize_run(
        pool,
        run_id,
        outcome,
        &ctx.entity_status,
        serde_json::to_value(ctx.stats)?,
        &ctx.fingerprints,
    )
    .await?;

    match staged {
        Ok(()) => {
            ctx.transition(RunState::Succeeded);
            Ok(RunReport {
                run_id,
                requested_mode: requested,
                mode,
                outcome: RunOutcome::Succeeded,
                stats: ctx.stats,
                failed_entity: None,
                error: None,
            })
        }
        Err(err) => {
            ctx.transition(RunState::Failed);
            let failed_entity = match &err {
                EtlError::ConstraintViolation { entity, .. } => Some(*entity),
                _ => None,
            };
            warn!(%run_id, error = %err, "run failed");
            Ok(RunReport {
                run_id,
                requested_mode: requested,
                mode,
                outcome: RunOutcome::Failed,
                stats: ctx.stats,
                failed_entity,
                error: Some(err.to_string()),
            })
        }
    }
}

fn fingerprint_sources(config: &Config) -> Result<BTreeMap<String, String>> {
    let mut fingerprints = BTreeMap::new();
    let names = [
        config::CALENDAR_FILE,
        config::PRODUCTS_FILE,
        config::STORES_FILE,
        config::SALES_FILE,
        config::CITIES_LOOKUP_FILE,
    ];
    for name in names {
        let path = config.raw_file(name);
        if path.is_file() {
            fingerprints.insert(name.to_string(), extract::fingerprint_file(&path)?);
        }
    }
    Ok(fingerprints)
}

fn note_cleaning<T>(stats: &mut RunStats, entity: Entity, cleaned: &Cleaned<T>) {
    let slot = stats.entity_mut(entity);
    slot.cleaned = cleaned.records.len();
    slot.rejected = cleaned.rejects.len();
    slot.superseded = cleaned.superseded;
    if let Some(first) = cleaned.rejects.first() {
        warn!(
            entity = %entity,
            rejected = cleaned.rejects.len(),
            first_line = first.line,
            reason = %first.reason,
            detail = %first.detail,
            "rows rejected during cleaning"
        );
    }
}

async fn run_stages(ctx: &mut RunContext<'_>) -> Result<()> {
    let cleaned_dir = ctx.config.cleaned_dir();

    ctx.transition(RunState::Extracting);
    let reuse_cleaned = ctx.mode == RunMode::Full
        && clean::cleaned_artifacts_exist(&cleaned_dir)
        && ctx
            .prior_success
            .as_ref()
            .and_then(|entry| entry.source_fingerprints.as_ref())
            .is_some_and(|prev| *prev == ctx.fingerprints);

    let bundle = if reuse_cleaned {
        info!("cleaned artifacts are current; skipping extraction and cleaning");
        let bundle = clean::read_cleaned_artifacts(&cleaned_dir)?;
        ctx.transition(RunState::Cleaning);
        for (entity, len) in [
            (Entity::DimDate, bundle.dates.len()),
            (Entity::DimProduct, bundle.products.len()),
            (Entity::DimStore, bundle.stores.len()),
            (Entity::FactSales, bundle.sales.len()),
        ] {
            let slot = ctx.stats.entity_mut(entity);
            slot.extracted = len;
            slot.cleaned = len;
        }
        bundle
    } else {
        let raw_dir = ctx.config.raw_dir();
        let calendar = extract::read_source(
            &raw_dir.join(config::CALENDAR_FILE),
            extract::CALENDAR_SCHEMA,
        )?;
        let products = extract::read_source(
            &raw_dir.join(config::PRODUCTS_FILE),
            extract::PRODUCTS_SCHEMA,
        )?;
        let stores =
            extract::read_source(&raw_dir.join(config::STORES_FILE), extract::STORES_SCHEMA)?;
        let sales =
            extract::read_source(&raw_dir.join(config::SALES_FILE), extract::SALES_SCHEMA)?;
        let lookup_path = raw_dir.join(config::CITIES_LOOKUP_FILE);
        let lookup = if lookup_path.is_file() {
            let table = extract::read_source(&lookup_path, extract::CITIES_LOOKUP_SCHEMA)?;
            Some(CityLookup::from_table(&table))
        } else {
            None
        };

        ctx.stats.dimdate.extracted = calendar.rows.len();
        ctx.stats.dimproduct.extracted = products.rows.len();
        ctx.stats.dimstore.extracted = stores.rows.len();
        ctx.stats.factsales.extracted = sales.rows.len();

        ctx.transition(RunState::Cleaning);
        let dates = clean::clean_calendar(&calendar);
        let products = clean::clean_products(&products);
        let stores = clean::clean_stores(&stores, lookup.as_ref());
        let sales = clean::clean_sales(&sales);
        note_cleaning(&mut ctx.stats, Entity::DimDate, &dates);
        note_cleaning(&mut ctx.stats, Entity::DimProduct, &products);
        note_cleaning(&mut ctx.stats, Entity::DimStore, &stores);
        note_cleaning(&mut ctx.stats, Entity::FactSales, &sales);

        let bundle = CleanedBundle {
            dates: dates.records,
            products: products.records,
            stores: stores.records,
            sales: sales.records,
        };
        clean::write_cleaned_artifacts(&cleaned_dir, &bundle)?;
        bundle
    };

    ctx.transition(RunState::DetectingChanges);
    let (dates, products, stores, sales) = if ctx.mode == RunMode::Incremental {
        let date_keys: Vec<i32> = bundle.dates.iter().map(|r| r.dateid).collect();
        let product_keys: Vec<i32> = bundle.products.iter().map(|r| r.productid).collect();
        let store_keys: Vec<i32> = bundle.stores.iter().map(|r| r.storeid).collect();
        let sales_keys: Vec<i64> = bundle.sales.iter().map(|r| r.salesid).collect();

        let stored_dates = detect::fetch_stored_dates(ctx.pool, &date_keys).await?;
        let stored_products = detect::fetch_stored_products(ctx.pool, &product_keys).await?;
        let stored_stores = detect::fetch_stored_stores(ctx.pool, &store_keys).await?;
        let existing_sales = detect::fetch_existing_sales_ids(ctx.pool, &sales_keys).await?;

        (
            detect::classify_dimension(bundle.dates, &stored_dates, |r| r.dateid, true),
            detect::classify_dimension(bundle.products, &stored_products, |r| r.productid, false),
            detect::classify_dimension(bundle.stores, &stored_stores, |r| r.storeid, false),
            detect::classify_facts(bundle.sales, &existing_sales),
        )
    } else {
        (
            ChangeSet::take_all(bundle.dates),
            ChangeSet::take_all(bundle.products),
            ChangeSet::take_all(bundle.stores),
            ChangeSet::take_all(bundle.sales),
        )
    };
    for (entity, unchanged) in [
        (Entity::DimDate, dates.unchanged),
        (Entity::DimProduct, products.unchanged),
        (Entity::DimStore, stores.unchanged),
        (Entity::FactSales, sales.unchanged),
    ] {
        ctx.stats.entity_mut(entity).unchanged = unchanged;
    }

    // Dimensions before facts; each batch is its own atomic unit, so a
    // failure here leaves earlier entities committed and later ones untouched.
    ctx.transition(RunState::LoadingDims);
    if !should_skip(ctx, Entity::DimDate) {
        let result = load::load_dates(ctx.pool, &dates.to_apply).await;
        note_load(ctx, Entity::DimDate, result)?;
    }
    if !should_skip(ctx, Entity::DimProduct) {
        let result = load::load_products(ctx.pool, &products.to_apply).await;
        note_load(ctx, Entity::DimProduct, result)?;
    }
    if !should_skip(ctx, Entity::DimStore) {
        let result = load::load_stores(ctx.pool, &stores.to_apply).await;
        note_load(ctx, Entity::DimStore, result)?;
    }

    ctx.transition(RunState::LoadingFacts);
    if !should_skip(ctx, Entity::FactSales) {
        let result = load::load_sales(ctx.pool, &sales.to_apply).await;
        note_load(ctx, Entity::FactSales, result)?;
    }

    Ok(())
}

fn should_skip(ctx: &mut RunContext<'_>, entity: Entity) -> bool {
    if ctx.resume_skip.contains(&entity) {
        info!(entity = %entity, "skipping entity committed by the previous failed run");
        ctx.set_status(entity, CommitStatus::Skipped);
        return true;
    }
    false
}

fn note_load(
    ctx: &mut RunContext<'_>,
    entity: Entity,
    result: Result<load::LoadOutcome>,
) -> Result<()> {
    match result {
        Ok(outcome) => {
            let slot = ctx.stats.entity_mut(entity);
            slot.applied = outcome.applied;
            slot.skipped = outcome.skipped;
            info!(
                entity = %entity,
                applied = outcome.applied,
                skipped = outcome.skipped,
                "entity batch committed"
            );
            ctx.set_status(entity, CommitStatus::Committed);
            Ok(())
        }
        Err(err) => {
            ctx.set_status(entity, CommitStatus::Failed);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ledger_entry(
        outcome: RunOutcome,
        committed: &[Entity],
        fingerprints: Option<BTreeMap<String, String>>,
    ) -> LedgerEntry {
        LedgerEntry {
            run_id: Uuid::new_v4(),
            mode: "FULL".into(),
            outcome,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            entity_status: Entity::LOAD_ORDER
                .iter()
                .map(|&entity| EntityStatus {
                    entity,
                    status: if committed.contains(&entity) {
                        CommitStatus::Committed
                    } else {
                        CommitStatus::Failed
                    },
                })
                .collect(),
            stats: None,
            source_fingerprints: fingerprints,
        }
    }

    #[test]
    fn incremental_without_prior_success_falls_back_to_full() {
        assert_eq!(resolve_mode(RunMode::Incremental, false), RunMode::Full);
        assert_eq!(
            resolve_mode(RunMode::Incremental, true),
            RunMode::Incremental
        );
        assert_eq!(resolve_mode(RunMode::Full, false), RunMode::Full);
        assert_eq!(resolve_mode(RunMode::Force, false), RunMode::Force);
    }

    #[test]
    fn resume_skips_committed_entities_of_a_failed_run_with_same_sources() {
        let fingerprints: BTreeMap<String, String> =
            [("sales.csv".to_string(), "abc".to_string())].into();
        let entry = ledger_entry(
            RunOutcome::Failed,
            &[Entity::DimDate, Entity::DimProduct],
            Some(fingerprints.clone()),
        );
        let skip = resume_entities(Some(&entry), &fingerprints);
        assert!(skip.contains(&Entity::DimDate));
        assert!(skip.contains(&Entity::DimProduct));
        assert!(!skip.contains(&Entity::DimStore));
    }

    #[test]
    fn resume_does_not_apply_when_sources_changed_or_run_succeeded() {
        let old: BTreeMap<String, String> = [("sales.csv".to_string(), "abc".to_string())].into();
        let new: BTreeMap<String, String> = [("sales.csv".to_string(), "def".to_string())].into();

        let failed = ledger_entry(RunOutcome::Failed, &[Entity::DimDate], Some(old.clone()));
        assert!(resume_entities(Some(&failed), &new).is_empty());

        let succeeded = ledger_entry(RunOutcome::Succeeded, &[Entity::DimDate], Some(old.clone()));
        assert!(resume_entities(Some(&succeeded), &old).is_empty());

        assert!(resume_entities(None, &old).is_empty());
    }
}
