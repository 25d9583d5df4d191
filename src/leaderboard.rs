use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::entities::{Metric, TagRef, TestSet};
use crate::error::{ArenaError, ArenaResult};

/// Stored Glicko ratings are 1500-centered; the public surface is
/// 1000-centered like the Elo boards. The shift happens here and only here.
const GLICKO_SURFACE_OFFSET: f64 = 500.0;

fn default_limit() -> i64 {
    20
}

fn default_min_votes() -> i64 {
    10
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    20
}

fn default_prompt_min_votes() -> i64 {
    5
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardParams {
    pub metric_name: String,
    pub test_set_name: String,
    pub tag_name: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default = "default_min_votes")]
    pub min_votes: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptLeaderboardParams {
    pub metric_name: String,
    pub test_set_name: String,
    pub model_slug: String,
    pub tag_name: Option<String>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
    #[serde(default = "default_prompt_min_votes")]
    pub min_votes: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricInfo {
    pub id: Uuid,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSetInfo {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagInfo {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rating: f64,
    pub vote_count: i64,
    pub win_count: i64,
    pub loss_count: i64,
    pub tie_count: i64,
    pub last_updated: DateTime<Utc>,
    pub model: ModelInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<TagInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardResponse {
    pub metric: MetricInfo,
    pub test_set_id: Uuid,
    pub test_set_name: String,
    pub entries: Vec<LeaderboardEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlickoLeaderboardEntry {
    pub rating: f64,
    pub deviation: f64,
    pub vote_count: i64,
    pub win_count: i64,
    pub loss_count: i64,
    pub tie_count: i64,
    pub last_updated: DateTime<Utc>,
    pub model: ModelInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<TagInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlickoLeaderboardResponse {
    pub metric: MetricInfo,
    pub test_set_id: Uuid,
    pub test_set_name: String,
    pub entries: Vec<GlickoLeaderboardEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Paging {
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
    pub total_items: i64,
    pub has_next: bool,
    pub has_previous: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptLeaderboardEntry {
    pub rating: f64,
    pub vote_count: i64,
    pub win_count: i64,
    pub loss_count: i64,
    pub tie_count: i64,
    pub last_updated: DateTime<Utc>,
    pub prompt_id: Uuid,
    pub prompt_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<TagInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptLeaderboardResponse {
    pub metric: MetricInfo,
    pub test_set_id: Uuid,
    pub test_set_name: String,
    pub model: ModelInfo,
    pub entries: Vec<PromptLeaderboardEntry>,
    pub paging: Paging,
}

#[derive(Debug, sqlx::FromRow)]
struct ModelBoardRow {
    rating: f64,
    vote_count: i64,
    win_count: i64,
    loss_count: i64,
    tie_count: i64,
    last_updated: DateTime<Utc>,
    model_external_id: Uuid,
    model_name: String,
    model_slug: String,
    tag_external_id: Option<Uuid>,
    tag_name: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct GlickoBoardRow {
    rating: f64,
    deviation: f64,
    vote_count: i64,
    win_count: i64,
    loss_count: i64,
    tie_count: i64,
    last_updated: DateTime<Utc>,
    model_external_id: Uuid,
    model_name: String,
    model_slug: String,
    tag_external_id: Option<Uuid>,
    tag_name: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct PromptBoardRow {
    rating: f64,
    vote_count: i64,
    win_count: i64,
    loss_count: i64,
    tie_count: i64,
    last_updated: DateTime<Utc>,
    prompt_external_id: Uuid,
    prompt_name: String,
    tag_external_id: Option<Uuid>,
    tag_name: Option<String>,
}

fn tag_info(external_id: Option<Uuid>, name: Option<String>) -> Option<TagInfo> {
    match (external_id, name) {
        (Some(id), Some(name)) => Some(TagInfo { id, name }),
        _ => None,
    }
}

/// Query-facing projections over the leaderboard tables. Global (tagless)
/// rows and tag-scoped rows are never mixed in one listing.
#[derive(Clone)]
pub struct Leaderboards {
    pool: PgPool,
}

impl Leaderboards {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn scope(
        &self,
        metric_name: &str,
        test_set_name: &str,
        tag_name: Option<&str>,
    ) -> ArenaResult<(Metric, TestSet, Option<TagRef>)> {
        let metric = sqlx::query_as::<_, Metric>(
            "SELECT id, external_id, name, description FROM scoring.metric WHERE name = $1",
        )
        .bind(metric_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("metric '{metric_name}'")))?;

        let test_set = sqlx::query_as::<_, TestSet>(
            "SELECT id, external_id, name FROM sample.test_set WHERE name = $1",
        )
        .bind(test_set_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("test set '{test_set_name}'")))?;

        let tag = match tag_name {
            Some(tag_name) => Some(
                sqlx::query_as::<_, TagRef>(
                    "SELECT id, external_id, name FROM specification.tag WHERE name = $1",
                )
                .bind(tag_name)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| ArenaError::NotFound(format!("tag '{tag_name}'")))?,
            ),
            None => None,
        };

        Ok((metric, test_set, tag))
    }

    pub async fn model_leaderboard(
        &self,
        params: &LeaderboardParams,
    ) -> ArenaResult<LeaderboardResponse> {
        let (metric, test_set, tag) = self
            .scope(
                &params.metric_name,
                &params.test_set_name,
                params.tag_name.as_deref(),
            )
            .await?;

        let tag_predicate = if tag.is_some() {
            "lb.tag_id = $4"
        } else {
            "lb.tag_id IS NULL"
        };
        let sql = format!(
            "SELECT lb.elo_score AS rating, lb.vote_count, lb.win_count, lb.loss_count, \
                    lb.tie_count, lb.last_updated, \
                    m.external_id AS model_external_id, m.name AS model_name, m.slug AS model_slug, \
                    t.external_id AS tag_external_id, t.name AS tag_name \
             FROM scoring.model_leaderboard lb \
             JOIN specification.model m ON m.id = lb.model_id \
             LEFT JOIN specification.tag t ON t.id = lb.tag_id \
             WHERE lb.metric_id = $1 AND lb.test_set_id = $2 AND lb.vote_count >= $3 \
               AND {tag_predicate} \
             ORDER BY lb.elo_score DESC \
             LIMIT {}",
            params.limit.clamp(1, 100),
        );

        let mut query = sqlx::query_as::<_, ModelBoardRow>(&sql)
            .bind(metric.id)
            .bind(test_set.id)
            .bind(params.min_votes.max(0));
        if let Some(tag) = &tag {
            query = query.bind(tag.id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        Ok(LeaderboardResponse {
            metric: MetricInfo {
                id: metric.external_id,
                name: metric.name,
                description: metric.description,
            },
            test_set_id: test_set.external_id,
            test_set_name: test_set.name,
            entries: rows
                .into_iter()
                .map(|row| LeaderboardEntry {
                    rating: row.rating,
                    vote_count: row.vote_count,
                    win_count: row.win_count,
                    loss_count: row.loss_count,
                    tie_count: row.tie_count,
                    last_updated: row.last_updated,
                    model: ModelInfo {
                        id: row.model_external_id,
                        name: row.model_name,
                        slug: row.model_slug,
                    },
                    tag: tag_info(row.tag_external_id, row.tag_name),
                })
                .collect(),
        })
    }

    pub async fn glicko_leaderboard(
        &self,
        params: &LeaderboardParams,
    ) -> ArenaResult<GlickoLeaderboardResponse> {
        let (metric, test_set, tag) = self
            .scope(
                &params.metric_name,
                &params.test_set_name,
                params.tag_name.as_deref(),
            )
            .await?;

        let tag_predicate = if tag.is_some() {
            "lb.tag_id = $4"
        } else {
            "lb.tag_id IS NULL"
        };
        let sql = format!(
            "SELECT lb.glicko_rating AS rating, lb.rating_deviation AS deviation, \
                    lb.vote_count, lb.win_count, lb.loss_count, lb.tie_count, lb.last_updated, \
                    m.external_id AS model_external_id, m.name AS model_name, m.slug AS model_slug, \
                    t.external_id AS tag_external_id, t.name AS tag_name \
             FROM scoring.model_glicko_leaderboard lb \
             JOIN specification.model m ON m.id = lb.model_id \
             LEFT JOIN specification.tag t ON t.id = lb.tag_id \
             WHERE lb.metric_id = $1 AND lb.test_set_id = $2 AND lb.vote_count >= $3 \
               AND {tag_predicate} \
             ORDER BY lb.glicko_rating DESC \
             LIMIT {}",
            params.limit.clamp(1, 100),
        );

        let mut query = sqlx::query_as::<_, GlickoBoardRow>(&sql)
            .bind(metric.id)
            .bind(test_set.id)
            .bind(params.min_votes.max(0));
        if let Some(tag) = &tag {
            query = query.bind(tag.id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        Ok(GlickoLeaderboardResponse {
            metric: MetricInfo {
                id: metric.external_id,
                name: metric.name,
                description: metric.description,
            },
            test_set_id: test_set.external_id,
            test_set_name: test_set.name,
            entries: rows
                .into_iter()
                .map(|row| GlickoLeaderboardEntry {
                    rating: row.rating - GLICKO_SURFACE_OFFSET,
                    deviation: row.deviation,
                    vote_count: row.vote_count,
                    win_count: row.win_count,
                    loss_count: row.loss_count,
                    tie_count: row.tie_count,
                    last_updated: row.last_updated,
                    model: ModelInfo {
                        id: row.model_external_id,
                        name: row.model_name,
                        slug: row.model_slug,
                    },
                    tag: tag_info(row.tag_external_id, row.tag_name),
                })
                .collect(),
        })
    }

    /// Which prompts a given model scores best on, paginated.
    pub async fn model_prompt_leaderboard(
        &self,
        params: &PromptLeaderboardParams,
    ) -> ArenaResult<PromptLeaderboardResponse> {
        let (metric, test_set, tag) = self
            .scope(
                &params.metric_name,
                &params.test_set_name,
                params.tag_name.as_deref(),
            )
            .await?;

        let model: Option<(i64, Uuid, String, String)> = sqlx::query_as(
            "SELECT id, external_id, name, slug FROM specification.model WHERE slug = $1",
        )
        .bind(&params.model_slug)
        .fetch_optional(&self.pool)
        .await?;
        let (model_id, model_external_id, model_name, model_slug) = model
            .ok_or_else(|| ArenaError::NotFound(format!("model '{}'", params.model_slug)))?;

        let tag_predicate = if tag.is_some() {
            "lb.tag_id = $5"
        } else {
            "lb.tag_id IS NULL"
        };

        let count_sql = format!(
            "SELECT COUNT(*) FROM scoring.prompt_leaderboard lb \
             WHERE lb.model_id = $1 AND lb.metric_id = $2 AND lb.test_set_id = $3 \
               AND lb.vote_count >= $4 AND {tag_predicate}"
        );
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql)
            .bind(model_id)
            .bind(metric.id)
            .bind(test_set.id)
            .bind(params.min_votes.max(0));
        if let Some(tag) = &tag {
            count_query = count_query.bind(tag.id);
        }
        let total_items = count_query.fetch_one(&self.pool).await?;

        let page = params.page.max(1);
        let page_size = params.page_size.clamp(1, 100);
        let total_pages = if total_items > 0 {
            (total_items + page_size - 1) / page_size
        } else {
            1
        };
        let offset = (page - 1) * page_size;

        let sql = format!(
            "SELECT lb.elo_score AS rating, lb.vote_count, lb.win_count, lb.loss_count, \
                    lb.tie_count, lb.last_updated, \
                    p.external_id AS prompt_external_id, p.name AS prompt_name, \
                    t.external_id AS tag_external_id, t.name AS tag_name \
             FROM scoring.prompt_leaderboard lb \
             JOIN specification.prompt p ON p.id = lb.prompt_id \
             LEFT JOIN specification.tag t ON t.id = lb.tag_id \
             WHERE lb.model_id = $1 AND lb.metric_id = $2 AND lb.test_set_id = $3 \
               AND lb.vote_count >= $4 AND {tag_predicate} \
             ORDER BY lb.elo_score DESC \
             LIMIT {page_size} OFFSET {offset}"
        );
        let mut query = sqlx::query_as::<_, PromptBoardRow>(&sql)
            .bind(model_id)
            .bind(metric.id)
            .bind(test_set.id)
            .bind(params.min_votes.max(0));
        if let Some(tag) = &tag {
            query = query.bind(tag.id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        Ok(PromptLeaderboardResponse {
            metric: MetricInfo {
                id: metric.external_id,
                name: metric.name,
                description: metric.description,
            },
            test_set_id: test_set.external_id,
            test_set_name: test_set.name,
            model: ModelInfo {
                id: model_external_id,
                name: model_name,
                slug: model_slug,
            },
            entries: rows
                .into_iter()
                .map(|row| PromptLeaderboardEntry {
                    rating: row.rating,
                    vote_count: row.vote_count,
                    win_count: row.win_count,
                    loss_count: row.loss_count,
                    tie_count: row.tie_count,
                    last_updated: row.last_updated,
                    prompt_id: row.prompt_external_id,
                    prompt_name: row.prompt_name,
                    tag: tag_info(row.tag_external_id, row.tag_name),
                })
                .collect(),
            paging: Paging {
                page,
                page_size,
                total_pages,
                total_items,
                has_next: page < total_pages,
                has_previous: page > 1,
            },
        })
    }

    pub async fn metrics(&self) -> ArenaResult<Vec<MetricInfo>> {
        let rows = sqlx::query_as::<_, Metric>(
            "SELECT id, external_id, name, description FROM scoring.metric ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|m| MetricInfo {
                id: m.external_id,
                name: m.name,
                description: m.description,
            })
            .collect())
    }

    pub async fn test_sets(&self) -> ArenaResult<Vec<TestSetInfo>> {
        let rows = sqlx::query_as::<_, TestSet>(
            "SELECT id, external_id, name FROM sample.test_set ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|t| TestSetInfo {
                id: t.external_id,
                name: t.name,
            })
            .collect())
    }

    /// Tags that actually appear in scored leaderboard rows.
    pub async fn scoring_tags(&self) -> ArenaResult<Vec<TagInfo>> {
        let rows = sqlx::query_as::<_, TagRef>(
            "SELECT t.id, t.external_id, t.name FROM specification.tag t \
             WHERE t.calculate_score \
               AND EXISTS ( \
                   SELECT 1 FROM scoring.model_leaderboard lb WHERE lb.tag_id = t.id \
               ) \
             ORDER BY t.name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|t| TagInfo {
                id: t.external_id,
                name: t.name,
            })
            .collect())
    }
}
