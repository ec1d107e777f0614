//! Upload stage: prepares per-article work items and applies them to the
//! relational store inside one outer transaction with per-article
//! savepoints, so one article's failure never rolls back its siblings.

use std::collections::HashMap;
use std::path::PathBuf;

use sqlx::{PgPool, Row};

use crate::cache::{CacheEnvelope, CacheStore};
use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::error::{IngestError, Result};
use crate::model::{
    AnalysisCollection, ArticleExtractionBundle, ArticleMetadata, BaseStudyPayload, CreateAnalysesResult,
    PreparedAnalysis, StudyPayload, TablePayload, UploadBehavior, UploadMetadataMode, UploadOutcome, UploadWorkItem,
};

/// Drop NUL bytes, which Postgres text columns reject outright.
fn sanitize_text(value: &str) -> String {
    value.replace('\u{0}', "")
}

/// A 12-character client-generated row id, matching the short-UUID scheme
/// the destination store expects for `BaseStudy`/`Study`/`Table`/`Analysis`/`Point` ids.
fn short_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn apply_text_field(target: &mut Option<String>, incoming: Option<&str>, mode: UploadMetadataMode) {
    let Some(incoming) = incoming else { return };
    let incoming = sanitize_text(incoming);
    if incoming.is_empty() {
        return;
    }
    match mode {
        UploadMetadataMode::Fill if target.as_ref().is_some_and(|v| !v.is_empty()) => {}
        _ => *target = Some(incoming),
    }
}

fn merge_metadata_blob(
    target: &mut serde_json::Map<String, serde_json::Value>,
    incoming: &HashMap<String, serde_json::Value>,
    mode: UploadMetadataMode,
) {
    for (key, value) in incoming {
        match mode {
            UploadMetadataMode::Fill => {
                target.entry(key.clone()).or_insert_with(|| value.clone());
            }
            UploadMetadataMode::Overwrite => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Build the `[UploadWorkItem]`s for one run: one item per article, with
/// identifiers taken from the first analysis collection that carries them
/// and metadata merged per `mode`. Articles with no per-table analyses are
/// skipped (logged, not an error).
pub fn prepare_work_items(
    bundles: &[ArticleExtractionBundle],
    analyses_by_article: &HashMap<String, Vec<CreateAnalysesResult>>,
    mode: UploadMetadataMode,
) -> Vec<UploadWorkItem> {
    let mut items = Vec::new();

    for bundle in bundles {
        let slug = &bundle.content.slug;
        let Some(table_results) = analyses_by_article.get(slug) else {
            tracing::info!("skipping upload for {slug}: no create-analyses output");
            continue;
        };

        let mut prepared = Vec::new();
        let mut identifier_source: Option<&AnalysisCollection> = None;
        for result in table_results {
            let collection = &result.analysis_collection;
            if identifier_source.is_none() && collection.identifier.is_some() {
                identifier_source = Some(collection);
            }
            let table = bundle
                .content
                .tables
                .iter()
                .find(|t| t.table_id == result.table_id)
                .cloned();
            let Some(table) = table else { continue };
            let table_payload = TablePayload {
                table_id: table.table_id.clone(),
                table_number: table.table_number,
                label: None,
                title: table.caption.clone(),
            };
            for analysis in &collection.analyses {
                prepared.push(PreparedAnalysis {
                    table: table_payload.clone(),
                    analysis: analysis.clone(),
                    coordinate_space: collection.coordinate_space,
                });
            }
        }

        if prepared.is_empty() {
            tracing::info!("skipping upload for {slug}: no analyses produced for any table");
            continue;
        }

        let mut base_study = BaseStudyPayload::default();
        if let Some(identifier) = identifier_source.and_then(|c| c.identifier.as_ref()) {
            apply_text_field(&mut base_study.doi, identifier.doi.as_deref(), mode);
            apply_text_field(&mut base_study.pmid, identifier.pmid.as_deref(), mode);
            apply_text_field(&mut base_study.pmcid, identifier.pmcid.as_deref(), mode);
        }
        apply_article_metadata(&mut base_study, &bundle.metadata, mode);

        let mut study = StudyPayload::default();
        apply_text_field(&mut study.name, bundle.metadata.title.as_deref(), mode);
        apply_text_field(&mut study.description, bundle.metadata.r#abstract.as_deref(), mode);
        merge_metadata_blob(&mut study.metadata_blob, &bundle.metadata.raw_metadata, mode);

        items.push(UploadWorkItem {
            article_slug: slug.clone(),
            base_study,
            study,
            analyses: prepared,
        });
    }

    items
}

fn apply_article_metadata(base_study: &mut BaseStudyPayload, metadata: &ArticleMetadata, mode: UploadMetadataMode) {
    apply_text_field(&mut base_study.name, metadata.title.as_deref(), mode);
    apply_text_field(&mut base_study.description, metadata.r#abstract.as_deref(), mode);
    apply_text_field(&mut base_study.publication, metadata.journal.as_deref(), mode);
    if !metadata.authors.is_empty() {
        let joined = metadata.authors.iter().map(|a| a.name.as_str()).collect::<Vec<_>>().join(", ");
        apply_text_field(&mut base_study.authors, Some(&joined), mode);
    }
    match mode {
        UploadMetadataMode::Fill if base_study.year.is_some() => {}
        _ => {
            if metadata.publication_year.is_some() {
                base_study.year = metadata.publication_year;
            }
        }
    }
    match mode {
        UploadMetadataMode::Fill if base_study.is_oa.is_some() => {}
        _ => {
            if metadata.open_access.is_some() {
                base_study.is_oa = metadata.open_access;
            }
        }
    }
}

/// Reject an empty or literal "UNKNOWN" analysis name, falling back through
/// the table's label, title, table id, and finally a constant.
fn resolve_analysis_name(raw: Option<&str>, table: &TablePayload, used: &mut HashMap<String, u32>) -> String {
    let candidate = raw
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("unknown"))
        .map(str::to_string)
        .or_else(|| table.label.clone())
        .or_else(|| table.title.clone())
        .unwrap_or_else(|| table.table_id.clone());
    let candidate = if candidate.trim().is_empty() { "analysis".to_string() } else { candidate };

    let count = used.entry(candidate.clone()).or_insert(0);
    *count += 1;
    if *count == 1 {
        candidate
    } else {
        format!("{candidate}-{}", *count)
    }
}

pub struct UploadStage {
    pool: PgPool,
    cache_root: PathBuf,
    cancellation: CancellationToken,
}

impl UploadStage {
    pub fn new(pool: PgPool, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            cache_root: cache_root.into(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Share a cancellation token with the pipeline driver: checked between
    /// articles so a ctrl-c stops opening new savepoints while letting the
    /// article currently in flight finish and commit.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Run every work item inside one outer transaction with per-article
    /// savepoints: a failing article is rolled back to its savepoint and
    /// recorded as a failed outcome, without aborting the rest of the run.
    pub async fn run(&self, settings: &Settings, items: Vec<UploadWorkItem>) -> Result<Vec<UploadOutcome>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let store = CacheStore::open(self.cache_root.join("upload").join("_default"))?;
        let mut outcomes = Vec::with_capacity(items.len());
        let mut new_entries = Vec::new();

        let mut tx = self.pool.begin().await.map_err(|e| IngestError::Store {
            message: "failed to open upload transaction".into(),
            source: Some(e),
        })?;

        for item in items {
            if self.cancellation.is_cancelled() {
                tracing::info!("cancellation requested, committing outcomes processed so far and stopping before the next article");
                break;
            }
            let slug = item.article_slug.clone();
            sqlx::query("SAVEPOINT item").execute(&mut *tx).await.map_err(|e| IngestError::Store {
                message: format!("failed to open savepoint for {slug}"),
                source: Some(e),
            })?;

            match process_item(&mut tx, &item, settings.upload_behavior, settings.upload_metadata_only, settings.upload_metadata_mode).await {
                Ok(outcome) => {
                    sqlx::query("RELEASE SAVEPOINT item").execute(&mut *tx).await.map_err(|e| IngestError::Store {
                        message: format!("failed to release savepoint for {slug}"),
                        source: Some(e),
                    })?;
                    new_entries.push((CacheEnvelope::new(slug.clone(), outcome.clone()), Default::default()));
                    outcomes.push(outcome);
                }
                Err(e) => {
                    sqlx::query("ROLLBACK TO SAVEPOINT item").execute(&mut *tx).await.map_err(|re| IngestError::Store {
                        message: format!("failed to roll back savepoint for {slug}"),
                        source: Some(re),
                    })?;
                    let outcome = UploadOutcome {
                        slug: slug.clone(),
                        base_study_id: None,
                        study_id: None,
                        analysis_ids: Vec::new(),
                        success: false,
                        error: Some(e.to_string()),
                    };
                    new_entries.push((CacheEnvelope::new(slug, outcome.clone()), Default::default()));
                    outcomes.push(outcome);
                }
            }
        }

        tx.commit().await.map_err(|e| IngestError::Store {
            message: "failed to commit upload transaction".into(),
            source: Some(e),
        })?;

        store.add_entries(&new_entries)?;
        Ok(outcomes)
    }
}

async fn process_item(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    item: &UploadWorkItem,
    behavior: UploadBehavior,
    metadata_only: bool,
    mode: UploadMetadataMode,
) -> Result<UploadOutcome> {
    let base_study_id = resolve_or_create_base_study(tx, &item.base_study, mode).await?;
    let study_id = resolve_or_create_study(tx, &base_study_id, &item.study, behavior, mode).await?;

    if metadata_only {
        return Ok(UploadOutcome {
            slug: item.article_slug.clone(),
            base_study_id: Some(base_study_id),
            study_id: Some(study_id),
            analysis_ids: Vec::new(),
            success: true,
            error: None,
        });
    }

    if behavior == UploadBehavior::Update {
        sqlx::query("DELETE FROM analyses WHERE study_id = $1")
            .bind(&study_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| IngestError::UploadTransaction {
                slug: item.article_slug.clone(),
                message: format!("failed clearing prior analyses: {e}"),
            })?;
        sqlx::query("DELETE FROM tables WHERE study_id = $1")
            .bind(&study_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| IngestError::UploadTransaction {
                slug: item.article_slug.clone(),
                message: format!("failed clearing prior tables: {e}"),
            })?;
    }

    let mut table_ids: HashMap<String, String> = HashMap::new();
    for prepared in &item.analyses {
        if !table_ids.contains_key(&prepared.table.table_id) {
            let table_row_id = upsert_table(tx, &study_id, &prepared.table).await?;
            table_ids.insert(prepared.table.table_id.clone(), table_row_id);
        }
    }

    let mut used_names: HashMap<String, u32> = HashMap::new();
    let mut analysis_ids = Vec::new();
    let mut order: i32 = 0;
    for prepared in &item.analyses {
        let table_row_id = table_ids.get(&prepared.table.table_id).expect("table inserted above");
        let name = resolve_analysis_name(prepared.analysis.name.as_deref(), &prepared.table, &mut used_names);
        let analysis_id = insert_analysis(tx, &study_id, table_row_id, &name, prepared, order).await?;
        order += 1;
        analysis_ids.push(analysis_id);
    }

    if !analysis_ids.is_empty() {
        sqlx::query("UPDATE base_studies SET has_coordinates = true WHERE id = $1")
            .bind(&base_study_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| IngestError::UploadTransaction {
                slug: item.article_slug.clone(),
                message: format!("failed flagging has_coordinates: {e}"),
            })?;
        sqlx::query("UPDATE studies SET level = 'group' WHERE id = $1")
            .bind(&study_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| IngestError::UploadTransaction {
                slug: item.article_slug.clone(),
                message: format!("failed setting study level: {e}"),
            })?;
    }

    Ok(UploadOutcome {
        slug: item.article_slug.clone(),
        base_study_id: Some(base_study_id),
        study_id: Some(study_id),
        analysis_ids,
        success: true,
        error: None,
    })
}

async fn resolve_or_create_base_study(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    payload: &BaseStudyPayload,
    mode: UploadMetadataMode,
) -> Result<String> {
    let existing = if let Some(doi) = &payload.doi {
        sqlx::query("SELECT id FROM base_studies WHERE doi = $1")
            .bind(doi)
            .fetch_optional(&mut **tx)
            .await
    } else {
        Ok(None)
    }
    .map_err(store_err("resolving base study by doi"))?;

    let existing = match existing {
        Some(row) => Some(row),
        None => {
            if let Some(pmid) = &payload.pmid {
                sqlx::query("SELECT id FROM base_studies WHERE pmid = $1")
                    .bind(pmid)
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(store_err("resolving base study by pmid"))?
            } else {
                None
            }
        }
    };

    if let Some(row) = existing {
        let id: String = row.try_get("id").map_err(store_err("reading base study id"))?;
        apply_base_study_update(tx, &id, payload, mode).await?;
        return Ok(id);
    }

    let id = short_uuid();
    sqlx::query(
        "INSERT INTO base_studies (id, doi, pmid, pmcid, name, description, publication, authors, year, is_oa, level) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'group')",
    )
    .bind(&id)
    .bind(&payload.doi)
    .bind(&payload.pmid)
    .bind(&payload.pmcid)
    .bind(&payload.name)
    .bind(&payload.description)
    .bind(&payload.publication)
    .bind(&payload.authors)
    .bind(payload.year)
    .bind(payload.is_oa)
    .execute(&mut **tx)
    .await
    .map_err(store_err("inserting base study"))?;

    Ok(id)
}

async fn apply_base_study_update(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: &str,
    payload: &BaseStudyPayload,
    mode: UploadMetadataMode,
) -> Result<()> {
    let clause = match mode {
        UploadMetadataMode::Fill => {
            "UPDATE base_studies SET \
             name = COALESCE(NULLIF(name, ''), $2), \
             description = COALESCE(NULLIF(description, ''), $3), \
             publication = COALESCE(NULLIF(publication, ''), $4), \
             authors = COALESCE(NULLIF(authors, ''), $5), \
             year = COALESCE(year, $6), \
             is_oa = COALESCE(is_oa, $7), \
             level = 'group' \
             WHERE id = $1"
        }
        UploadMetadataMode::Overwrite => {
            "UPDATE base_studies SET \
             name = COALESCE($2, name), \
             description = COALESCE($3, description), \
             publication = COALESCE($4, publication), \
             authors = COALESCE($5, authors), \
             year = COALESCE($6, year), \
             is_oa = COALESCE($7, is_oa), \
             level = 'group' \
             WHERE id = $1"
        }
    };
    sqlx::query(clause)
        .bind(id)
        .bind(&payload.name)
        .bind(&payload.description)
        .bind(&payload.publication)
        .bind(&payload.authors)
        .bind(payload.year)
        .bind(payload.is_oa)
        .execute(&mut **tx)
        .await
        .map_err(store_err("updating base study"))?;
    Ok(())
}

async fn resolve_or_create_study(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    base_study_id: &str,
    payload: &StudyPayload,
    behavior: UploadBehavior,
    mode: UploadMetadataMode,
) -> Result<String> {
    let existing = if behavior == UploadBehavior::Update {
        sqlx::query("SELECT id FROM studies WHERE base_study_id = $1 AND source = 'llm'")
            .bind(base_study_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(store_err("resolving study"))?
    } else {
        None
    };

    let metadata_blob = serde_json::Value::Object(payload.metadata_blob.clone());

    if let Some(row) = existing {
        let id: String = row.try_get("id").map_err(store_err("reading study id"))?;
        let clause = match mode {
            UploadMetadataMode::Fill => {
                "UPDATE studies SET \
                 name = COALESCE(NULLIF(name, ''), $2), \
                 description = COALESCE(NULLIF(description, ''), $3), \
                 metadata = COALESCE(metadata, '{}'::jsonb) || $4, \
                 source_updated_at = now() \
                 WHERE id = $1"
            }
            UploadMetadataMode::Overwrite => {
                "UPDATE studies SET \
                 name = COALESCE($2, name), \
                 description = COALESCE($3, description), \
                 metadata = COALESCE(metadata, '{}'::jsonb) || $4, \
                 source_updated_at = now() \
                 WHERE id = $1"
            }
        };
        sqlx::query(clause)
            .bind(&id)
            .bind(&payload.name)
            .bind(&payload.description)
            .bind(&metadata_blob)
            .execute(&mut **tx)
            .await
            .map_err(store_err("updating study"))?;
        return Ok(id);
    }

    let id = short_uuid();
    sqlx::query(
        "INSERT INTO studies (id, base_study_id, source, name, description, metadata, source_updated_at) \
         VALUES ($1, $2, 'llm', $3, $4, $5, now())",
    )
    .bind(&id)
    .bind(base_study_id)
    .bind(&payload.name)
    .bind(&payload.description)
    .bind(&metadata_blob)
    .execute(&mut **tx)
    .await
    .map_err(store_err("inserting study"))?;

    Ok(id)
}

async fn upsert_table(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, study_id: &str, table: &TablePayload) -> Result<String> {
    let row = sqlx::query(
        "INSERT INTO tables (id, study_id, t_id, number, label, title) VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (study_id, t_id) DO UPDATE SET number = EXCLUDED.number, label = EXCLUDED.label, title = EXCLUDED.title \
         RETURNING id",
    )
    .bind(short_uuid())
    .bind(study_id)
    .bind(&table.table_id)
    .bind(table.table_number.map(|n| n as i32))
    .bind(&table.label)
    .bind(&table.title)
    .fetch_one(&mut **tx)
    .await
    .map_err(store_err("upserting table"))?;

    row.try_get("id").map_err(store_err("reading table id"))
}

async fn insert_analysis(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    study_id: &str,
    table_id: &str,
    name: &str,
    prepared: &PreparedAnalysis,
    order: i32,
) -> Result<String> {
    let analysis_id = short_uuid();
    sqlx::query(
        "INSERT INTO analyses (id, study_id, table_id, name, description, \"order\") VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&analysis_id)
    .bind(study_id)
    .bind(table_id)
    .bind(name)
    .bind(&prepared.analysis.description)
    .bind(order)
    .execute(&mut **tx)
    .await
    .map_err(store_err("inserting analysis"))?;

    for (point_order, coordinate) in prepared.analysis.coordinates.iter().enumerate() {
        let space = prepared.coordinate_space.or(coordinate.space);
        let point_id = short_uuid();
        sqlx::query(
            "INSERT INTO points (id, analysis_id, x, y, z, space, \"order\") VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&point_id)
        .bind(&analysis_id)
        .bind(coordinate.x)
        .bind(coordinate.y)
        .bind(coordinate.z)
        .bind(space.map(|s| format!("{s:?}").to_uppercase()))
        .bind(point_order as i32 + 1)
        .execute(&mut **tx)
        .await
        .map_err(store_err("inserting point"))?;

        if coordinate.statistic_type.is_some() || coordinate.statistic_value.is_some() {
            sqlx::query("INSERT INTO point_values (id, point_id, kind, value) VALUES ($1, $2, $3, $4)")
                .bind(short_uuid())
                .bind(&point_id)
                .bind(coordinate.statistic_type.map(|k| format!("{k:?}")))
                .bind(coordinate.statistic_value)
                .execute(&mut **tx)
                .await
                .map_err(store_err("inserting point value"))?;
        }
    }

    Ok(analysis_id)
}

fn store_err(context: &'static str) -> impl Fn(sqlx::Error) -> IngestError {
    move |e| IngestError::Store {
        message: context.to_string(),
        source: Some(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Analysis, Coordinate, CoordinateSpace, ExtractedContent, ExtractedTable};

    fn sample_bundle() -> ArticleExtractionBundle {
        ArticleExtractionBundle {
            content: ExtractedContent {
                slug: "a1".into(),
                source: "pubget".into(),
                identifier: None,
                full_text_path: None,
                tables: vec![ExtractedTable {
                    table_id: "table-1".into(),
                    raw_content_path: None,
                    table_number: Some(1),
                    caption: Some("Main results".into()),
                    footer: None,
                    coordinates: vec![Coordinate::new(1.0, 2.0, 3.0)],
                    space: Some(CoordinateSpace::Mni),
                    metadata: HashMap::new(),
                }],
                has_coordinates: true,
                extracted_at: chrono::Utc::now(),
                error_message: None,
            },
            metadata: ArticleMetadata {
                title: Some("A Title".into()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn prepare_work_items_skips_articles_with_no_analyses() {
        let bundle = sample_bundle();
        let items = prepare_work_items(&[bundle], &HashMap::new(), UploadMetadataMode::Fill);
        assert!(items.is_empty());
    }

    #[test]
    fn prepare_work_items_builds_one_item_per_article() {
        let bundle = sample_bundle();
        let collection = AnalysisCollection {
            slug: "a1".into(),
            coordinate_space: Some(CoordinateSpace::Mni),
            identifier: None,
            analyses: vec![Analysis {
                name: Some("Contrast A".into()),
                description: None,
                coordinates: vec![Coordinate::new(1.0, 2.0, 3.0)],
                table_id: "table-1".into(),
                table_number: Some(1),
                table_caption: None,
                table_footer: None,
                metadata: HashMap::new(),
            }],
        };
        let result = CreateAnalysesResult {
            slug: "a1::table-1".into(),
            article_slug: "a1".into(),
            table_id: "table-1".into(),
            sanitized_table_id: "table-1".into(),
            analysis_collection: collection,
            analysis_paths: Vec::new(),
            metadata: HashMap::new(),
            error_message: None,
        };
        let mut by_article = HashMap::new();
        by_article.insert("a1".to_string(), vec![result]);

        let items = prepare_work_items(&[bundle], &by_article, UploadMetadataMode::Fill);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].analyses.len(), 1);
        assert_eq!(items[0].study.name.as_deref(), Some("A Title"));
    }

    #[test]
    fn resolve_analysis_name_falls_back_and_dedupes() {
        let table = TablePayload {
            table_id: "table-1".into(),
            table_number: None,
            label: None,
            title: None,
        };
        let mut used = HashMap::new();
        assert_eq!(resolve_analysis_name(Some("UNKNOWN"), &table, &mut used), "table-1");
        assert_eq!(resolve_analysis_name(Some("UNKNOWN"), &table, &mut used), "table-1-2");
        assert_eq!(resolve_analysis_name(Some("Contrast A"), &table, &mut used), "Contrast A");
    }
}
