//! The shared import loop.
//!
//! Every importer runs the same skeleton, parameterized by an
//! [`EntityPolicy`]:
//!
//! 1. Count eligible source rows and apply `offset`/`limit`
//! 2. Fetch pages of `batch_size` rows in ascending primary-key order
//! 3. Per row: resolve references, look for an existing target record,
//!    transform, create, write the mapping, link attachments, create
//!    children
//! 4. Checkpoint the mapping cache every `checkpoint_every` pages and once
//!    more when the range is exhausted
//!
//! Required references are checked before the duplicate lookup only when
//! the policy's natural key is built from them. A ref-free key lets an
//! already imported record be skipped even while one of its mappings is
//! missing.
//!
//! ## Error handling
//!
//! A [`RecordError`] fails only the record it belongs to and becomes a
//! `Failed` outcome. Once the parent row exists, a failing link or child is
//! recorded in its own bucket and the parent stays `Migrated`. Source and cache errors abort the importer: without a
//! reliable mapping cache no foreign key can be resolved safely.

use super::cache::CacheError;
use super::entity::EntityId;
use super::importer::ImportContext;
use super::outcome::{Detail, ImportOutcome};
use super::policy::{EntityPolicy, ResolvedRefs};
use super::result::ImportResult;
use super::source::SourceRow;
use super::target::{ChildRecords, NaturalKey, TargetRecord};
use crate::error::{MigrationError, RecordError, StoreError};

pub const ALREADY_EXISTS: &str = "Already exists.";

/// Why a record could not be processed.
enum StepError {
    /// Absorbed into the result.
    Record(RecordError),
    /// Aborts the importer.
    Cache(CacheError),
}

impl From<RecordError> for StepError {
    fn from(err: RecordError) -> Self {
        StepError::Record(err)
    }
}

impl From<CacheError> for StepError {
    fn from(err: CacheError) -> Self {
        StepError::Cache(err)
    }
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        StepError::Record(RecordError::Store(err))
    }
}

/// Import every eligible row of `policy`'s source into `result`.
///
/// # Arguments
/// * `policy` - What to import
/// * `ctx` - Stores, cache, reporter and run options
/// * `result` - Receives one outcome per processed row, plus child outcomes
///
/// # Returns
/// `Ok(())` once the range is exhausted, even if every record failed.
pub async fn run_import(
    policy: &dyn EntityPolicy,
    ctx: &ImportContext<'_>,
    result: &mut ImportResult,
) -> Result<(), MigrationError> {
    let entity = policy.entity();
    let query = policy.source();
    let options = &ctx.options;

    let eligible = ctx
        .source
        .count(&query)
        .await
        .map_err(MigrationError::Source)?;
    let mut total = eligible.saturating_sub(options.offset);
    if let Some(limit) = options.limit {
        total = total.min(limit);
    }

    log::info!(
        "{}: {} eligible rows in {}, processing {} (offset {}{})",
        entity,
        eligible,
        query.table,
        total,
        options.offset,
        if options.dry_run { ", dry run" } else { "" }
    );
    ctx.reporter.start(entity, total);

    let batch_size = options.batch_size.max(1);
    let checkpoint_every = options.checkpoint_every.max(1);
    let mut processed: u64 = 0;
    let mut page = 0;
    let mut unsaved_pages = 0;

    while processed < total {
        let wanted = batch_size.min(total - processed);
        let rows = ctx
            .source
            .fetch_page(&query, options.offset + processed, wanted)
            .await
            .map_err(MigrationError::Source)?;
        if rows.is_empty() {
            log::debug!("{}: source exhausted after {} rows", entity, processed);
            break;
        }
        page += 1;
        log::debug!("{}: page {} fetched ({} rows)", entity, page, rows.len());

        for row in rows {
            // Cooperative limit, checked once per record.
            if processed >= total {
                break;
            }

            let described = policy.describe(&row);
            let outcomes = match row.i64(query.primary_key) {
                Ok(source_id) => {
                    match process_record(policy, ctx, &row, source_id, described.clone()).await {
                        Ok(outcomes) => outcomes,
                        Err(StepError::Record(err)) => {
                            vec![(entity, failed(source_id, err, described))]
                        }
                        Err(StepError::Cache(err)) => {
                            log::error!(
                                "{}: mapping cache failed at source #{}: {}",
                                entity,
                                source_id,
                                err
                            );
                            return Err(MigrationError::Cache(err));
                        }
                    }
                }
                Err(err) => vec![(entity, failed(0, err, described))],
            };

            for (bucket, outcome) in outcomes {
                if let ImportOutcome::Failed {
                    source_id,
                    kind,
                    error,
                    ..
                } = &outcome
                {
                    log::warn!(
                        "{}: source #{} failed ({:?}): {}",
                        bucket,
                        source_id,
                        kind,
                        error
                    );
                    ctx.reporter.record_error(bucket, *source_id, error);
                }
                result.record(bucket, outcome);
            }

            processed += 1;
            ctx.reporter.advance(entity, processed);
        }

        if !options.dry_run {
            unsaved_pages += 1;
            if unsaved_pages >= checkpoint_every {
                ctx.cache.checkpoint().await?;
                unsaved_pages = 0;
            }
        }
    }

    if unsaved_pages > 0 {
        ctx.cache.checkpoint().await?;
    }

    ctx.reporter.finish(entity, processed);
    log::info!(
        "{}: finished, {} migrated, {} skipped, {} failed",
        entity,
        result.migrated(entity),
        result.skipped(entity),
        result.failed(entity)
    );
    Ok(())
}

fn failed(source_id: i64, err: RecordError, detail: Detail) -> ImportOutcome {
    ImportOutcome::Failed {
        source_id,
        kind: err.kind(),
        error: err.to_string(),
        detail,
    }
}

/// Process one row. Returns the row's own outcome first, followed by the
/// outcomes of any child records.
async fn process_record(
    policy: &dyn EntityPolicy,
    ctx: &ImportContext<'_>,
    row: &SourceRow,
    source_id: i64,
    mut detail: Detail,
) -> Result<Vec<(EntityId, ImportOutcome)>, StepError> {
    let entity = policy.entity();
    let dry_run = ctx.options.dry_run;

    let refs = resolve_references(policy, ctx, row).await?;
    if policy.key_uses_references() {
        refs.ensure_required()?;
    }
    let key = policy.natural_key(row, &refs)?;

    if let Some(existing) = find_existing(ctx, entity, &key).await? {
        detail.insert("target_id".into(), existing.into());
        let mut outcomes = vec![(
            entity,
            ImportOutcome::Skipped {
                source_id,
                reason: ALREADY_EXISTS.to_string(),
                detail,
            },
        )];
        if dry_run {
            ctx.overlay.remember(entity, source_id, existing);
            return Ok(outcomes);
        }

        ctx.cache
            .put(
                entity,
                source_id,
                existing,
                &policy.cache_scope(),
                policy.mapping_ttl(),
            )
            .await?;
        // Links are idempotent; re-linking repairs a record whose
        // attachments failed on an earlier run.
        match policy.transform(row, &refs) {
            Ok(record) => {
                link_attachments(ctx, &record, source_id, existing, &mut outcomes).await;
            }
            Err(err) => log::debug!("{}: source #{} not re-linked: {}", entity, source_id, err),
        }
        return Ok(outcomes);
    }

    refs.ensure_required()?;
    let record = policy.transform(row, &refs)?;

    let target_id = if dry_run {
        let fingerprint = (!key.is_empty()).then(|| key.fingerprint());
        ctx.overlay.allocate(entity, source_id, fingerprint)
    } else {
        let id = ctx.target.create(entity, &record.fields).await?;
        ctx.cache
            .put(
                entity,
                source_id,
                id,
                &policy.cache_scope(),
                policy.mapping_ttl(),
            )
            .await?;
        id
    };

    let mut outcomes = vec![(
        entity,
        ImportOutcome::Migrated {
            source_id,
            target_id,
            detail,
        },
    )];
    if !dry_run {
        link_attachments(ctx, &record, source_id, target_id, &mut outcomes).await;
    }
    for children in &record.children {
        create_children(ctx, children, source_id, target_id, &mut outcomes).await;
    }
    Ok(outcomes)
}

/// Link `target_id` to the records named by `record`'s attachments. A
/// failing link is recorded under the relation's name.
async fn link_attachments(
    ctx: &ImportContext<'_>,
    record: &TargetRecord,
    source_id: i64,
    target_id: i64,
    outcomes: &mut Vec<(EntityId, ImportOutcome)>,
) {
    for attachment in &record.attachments {
        let linked = ctx
            .target
            .attach(
                attachment.relation,
                (attachment.owner_field, target_id),
                (attachment.other_field, attachment.other_id),
            )
            .await;
        if let Err(err) = linked {
            let mut fields = Detail::new();
            fields.insert(attachment.owner_field.to_string(), target_id.into());
            fields.insert(attachment.other_field.to_string(), attachment.other_id.into());
            outcomes.push((
                EntityId::new(attachment.relation),
                failed(source_id, RecordError::Store(err), fields),
            ));
        }
    }
}

/// Resolve each declared reference through the mapping cache (and the
/// dry-run overlay first, during dry runs). Null and zero ids are absent.
async fn resolve_references(
    policy: &dyn EntityPolicy,
    ctx: &ImportContext<'_>,
    row: &SourceRow,
) -> Result<ResolvedRefs, StepError> {
    let mut refs = ResolvedRefs::new();
    for reference in policy.references() {
        let source_id = row.opt_i64(reference.field)?.filter(|id| *id != 0);
        let target_id = match source_id {
            Some(id) => lookup(ctx, reference.entity, id).await?,
            None => None,
        };
        refs.push(reference, source_id, target_id);
    }
    for (entity, source_id) in policy.lookups(row)? {
        if source_id == 0 {
            continue;
        }
        if let Some(target_id) = lookup(ctx, entity, source_id).await? {
            refs.push_lookup(entity, source_id, target_id);
        }
    }
    Ok(refs)
}

async fn lookup(
    ctx: &ImportContext<'_>,
    entity: EntityId,
    source_id: i64,
) -> Result<Option<i64>, CacheError> {
    if ctx.options.dry_run {
        if let Some(id) = ctx.overlay.lookup(entity, source_id) {
            return Ok(Some(id));
        }
    }
    Ok(ctx
        .cache
        .get(entity, source_id)
        .await?
        .filter(|id| *id != 0))
}

async fn find_existing(
    ctx: &ImportContext<'_>,
    entity: EntityId,
    key: &NaturalKey,
) -> Result<Option<i64>, StepError> {
    if key.is_empty() {
        return Ok(None);
    }
    if ctx.options.dry_run {
        if let Some(id) = ctx.overlay.find_key(entity, &key.fingerprint()) {
            return Ok(Some(id));
        }
    }
    Ok(ctx.target.find_existing(entity, key).await?)
}

/// Create child rows for a freshly created parent. A failing child is
/// recorded in the child bucket and does not affect its siblings.
async fn create_children(
    ctx: &ImportContext<'_>,
    children: &ChildRecords,
    parent_source_id: i64,
    parent_target_id: i64,
    outcomes: &mut Vec<(EntityId, ImportOutcome)>,
) {
    for fields in &children.rows {
        let mut fields = fields.clone();
        fields.insert(children.parent_field.to_string(), parent_target_id.into());

        let outcome = if ctx.options.dry_run {
            ImportOutcome::Migrated {
                source_id: parent_source_id,
                target_id: ctx.overlay.synthetic_id(),
                detail: fields,
            }
        } else {
            match ctx.target.create(children.entity, &fields).await {
                Ok(id) => ImportOutcome::Migrated {
                    source_id: parent_source_id,
                    target_id: id,
                    detail: fields,
                },
                Err(err) => failed(parent_source_id, RecordError::Store(err), fields),
            }
        };
        outcomes.push((children.entity, outcome));
    }
}
