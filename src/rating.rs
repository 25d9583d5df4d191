use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Transaction};

use crate::config::ArenaConfig;
use crate::elo;
use crate::entities::{PendingComparison, RankedSampleRow, RatingSystem};
use crate::gate::SingleFlightGate;
use crate::glicko::{self, GlickoRating};
use crate::telemetry::TelemetrySink;

/// Margin subtracted from the gate TTL to form the wall-clock cap, so a
/// long drain releases the gate before the key can expire under it.
const WALL_CLOCK_MARGIN_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Leaderboard subjects and cache rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Model(i64),
    Prompt { prompt_id: i64, model_id: i64 },
    Sample(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    Model,
    Prompt,
    Sample,
}

impl SubjectKind {
    pub const ALL: [SubjectKind; 3] = [SubjectKind::Model, SubjectKind::Prompt, SubjectKind::Sample];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoardKey {
    pub subject: Subject,
    pub metric_id: i64,
    pub test_set_id: i64,
    pub tag_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct EloRow {
    pub row_id: Option<i64>,
    pub rating: f64,
    pub votes: i64,
    pub wins: i64,
    pub losses: i64,
    pub ties: i64,
    pub dirty: bool,
}

impl Default for EloRow {
    fn default() -> Self {
        Self {
            row_id: None,
            rating: elo::INITIAL_RATING,
            votes: 0,
            wins: 0,
            losses: 0,
            ties: 0,
            dirty: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GlickoRow {
    pub row_id: Option<i64>,
    pub rating: GlickoRating,
    pub votes: i64,
    pub wins: i64,
    pub losses: i64,
    pub ties: i64,
    pub dirty: bool,
}

// ---------------------------------------------------------------------------
// Comparison context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOutcome {
    FirstWins,
    Tie,
}

impl ComparisonOutcome {
    fn score_for_first(self) -> f64 {
        match self {
            ComparisonOutcome::FirstWins => 1.0,
            ComparisonOutcome::Tie => 0.5,
        }
    }

    fn roles(self) -> (OutcomeRole, OutcomeRole) {
        match self {
            ComparisonOutcome::FirstWins => (OutcomeRole::Win, OutcomeRole::Loss),
            ComparisonOutcome::Tie => (OutcomeRole::Tie, OutcomeRole::Tie),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutcomeRole {
    Win,
    Loss,
    Tie,
}

#[derive(Debug, Clone)]
pub struct SideContext {
    pub sample_id: i64,
    pub model_id: i64,
    pub prompt_id: i64,
    pub tag_ids: Vec<i64>,
}

impl SideContext {
    fn subject(&self, kind: SubjectKind) -> Subject {
        match kind {
            SubjectKind::Model => Subject::Model(self.model_id),
            SubjectKind::Prompt => Subject::Prompt {
                prompt_id: self.prompt_id,
                model_id: self.model_id,
            },
            SubjectKind::Sample => Subject::Sample(self.sample_id),
        }
    }
}

/// Everything a single comparison needs for a rating update, loaded eagerly.
/// `first` is the rank-1 side (or an arbitrary side of a tie).
#[derive(Debug, Clone)]
pub struct ComparisonContext {
    pub comparison_id: i64,
    pub metric_id: i64,
    pub test_set_id: i64,
    pub outcome: ComparisonOutcome,
    pub first: SideContext,
    pub second: SideContext,
}

impl ComparisonContext {
    fn key(&self, subject: Subject, tag_id: Option<i64>) -> BoardKey {
        BoardKey {
            subject,
            metric_id: self.metric_id,
            test_set_id: self.test_set_id,
            tag_id,
        }
    }

    /// Tags scored for this comparison: only tags both sides' prompts
    /// carry. A tag present on one side alone has no opponent row to rate
    /// against and is not touched.
    fn shared_tags(&self) -> BTreeSet<i64> {
        let first: BTreeSet<i64> = self.first.tag_ids.iter().copied().collect();
        let second: BTreeSet<i64> = self.second.tag_ids.iter().copied().collect();
        first.intersection(&second).copied().collect()
    }

    /// Every board row this comparison reads or writes: the tagless rows for
    /// both subjects plus, for each shared tag, both subjects' tag-scoped
    /// rows.
    pub fn board_keys(&self) -> Vec<BoardKey> {
        let mut keys = Vec::new();
        for kind in SubjectKind::ALL {
            keys.push(self.key(self.first.subject(kind), None));
            keys.push(self.key(self.second.subject(kind), None));
        }
        for tag in self.shared_tags() {
            for kind in SubjectKind::ALL {
                keys.push(self.key(self.first.subject(kind), Some(tag)));
                keys.push(self.key(self.second.subject(kind), Some(tag)));
            }
        }
        keys
    }
}

/// Partitions a comparison's ranks into a context. A comparison is a tie iff
/// both samples carry rank 1; otherwise the rank-1 sample won and the rank-2
/// sample lost. Anything else is malformed and gets skipped.
pub fn build_context(
    comparison: &PendingComparison,
    ranks: &[RankedSampleRow],
    tags_by_prompt: &HashMap<i64, Vec<i64>>,
) -> Result<ComparisonContext> {
    if ranks.len() != 2 {
        anyhow::bail!(
            "comparison {} has {} ranks, expected 2",
            comparison.id,
            ranks.len()
        );
    }

    let side = |row: &RankedSampleRow| SideContext {
        sample_id: row.sample_id,
        model_id: row.model_id,
        prompt_id: row.prompt_id,
        tag_ids: tags_by_prompt
            .get(&row.prompt_id)
            .cloned()
            .unwrap_or_default(),
    };

    let (a, b) = (&ranks[0], &ranks[1]);
    let (outcome, first, second) = match (a.rank, b.rank) {
        (1, 1) => (ComparisonOutcome::Tie, side(a), side(b)),
        (1, 2) => (ComparisonOutcome::FirstWins, side(a), side(b)),
        (2, 1) => (ComparisonOutcome::FirstWins, side(b), side(a)),
        (ra, rb) => anyhow::bail!(
            "comparison {} has invalid rank pair ({ra}, {rb})",
            comparison.id
        ),
    };

    Ok(ComparisonContext {
        comparison_id: comparison.id,
        metric_id: comparison.metric_id,
        test_set_id: comparison.test_set_id,
        outcome,
        first,
        second,
    })
}

// ---------------------------------------------------------------------------
// Pure rating application
// ---------------------------------------------------------------------------

fn bump_elo(row: &mut EloRow, rating: f64, role: OutcomeRole) {
    row.rating = rating;
    row.votes += 1;
    match role {
        OutcomeRole::Win => row.wins += 1,
        OutcomeRole::Loss => row.losses += 1,
        OutcomeRole::Tie => row.ties += 1,
    }
    row.dirty = true;
}

fn pairwise_elo(
    rows: &mut HashMap<BoardKey, EloRow>,
    key_a: BoardKey,
    key_b: BoardKey,
    score_a: f64,
    role_a: OutcomeRole,
    role_b: OutcomeRole,
) {
    let rating_a = rows.entry(key_a).or_default().rating;
    let rating_b = rows.entry(key_b).or_default().rating;
    let (new_a, new_b) = elo::update_pair(rating_a, rating_b, score_a);
    bump_elo(rows.entry(key_a).or_default(), new_a, role_a);
    bump_elo(rows.entry(key_b).or_default(), new_b, role_b);
}

/// Applies one comparison to the Elo boards. All updates read pre-comparison
/// values; distinct rows never observe intermediate state from the same
/// comparison. Tag-scoped rows move only for tags shared by both sides'
/// prompts, mirroring the tagless loop.
pub fn apply_elo(ctx: &ComparisonContext, rows: &mut HashMap<BoardKey, EloRow>) {
    let score_first = ctx.outcome.score_for_first();
    let (role_first, role_second) = ctx.outcome.roles();

    for kind in SubjectKind::ALL {
        pairwise_elo(
            rows,
            ctx.key(ctx.first.subject(kind), None),
            ctx.key(ctx.second.subject(kind), None),
            score_first,
            role_first,
            role_second,
        );
    }

    for tag in ctx.shared_tags() {
        for kind in SubjectKind::ALL {
            pairwise_elo(
                rows,
                ctx.key(ctx.first.subject(kind), Some(tag)),
                ctx.key(ctx.second.subject(kind), Some(tag)),
                score_first,
                role_first,
                role_second,
            );
        }
    }
}

fn current_glicko(
    rows: &HashMap<BoardKey, GlickoRow>,
    staged: &HashMap<BoardKey, GlickoRow>,
    key: &BoardKey,
) -> GlickoRow {
    staged
        .get(key)
        .or_else(|| rows.get(key))
        .cloned()
        .unwrap_or_default()
}

fn bump_glicko(row: &mut GlickoRow, rating: GlickoRating, role: OutcomeRole) {
    row.rating = rating;
    row.votes += 1;
    match role {
        OutcomeRole::Win => row.wins += 1,
        OutcomeRole::Loss => row.losses += 1,
        OutcomeRole::Tie => row.ties += 1,
    }
    row.dirty = true;
}

fn pairwise_glicko(
    rows: &HashMap<BoardKey, GlickoRow>,
    staged: &mut HashMap<BoardKey, GlickoRow>,
    key_a: BoardKey,
    key_b: BoardKey,
    score_a: f64,
    role_a: OutcomeRole,
    role_b: OutcomeRole,
) -> Result<()> {
    let mut a = current_glicko(rows, staged, &key_a);
    let mut b = current_glicko(rows, staged, &key_b);
    let new_a = glicko::update_rating(a.rating, &[(b.rating, score_a)])?;
    let new_b = glicko::update_rating(b.rating, &[(a.rating, 1.0 - score_a)])?;
    bump_glicko(&mut a, new_a, role_a);
    bump_glicko(&mut b, new_b, role_b);
    staged.insert(key_a, a);
    staged.insert(key_b, b);
    Ok(())
}

/// Applies one comparison to the Glicko boards. The update is staged and
/// only merged on success, so a non-convergent iteration leaves the cache
/// untouched and the comparison unmarked for retry. Tag-scoped rows move
/// only for tags shared by both sides' prompts, mirroring the tagless loop.
pub fn apply_glicko(
    ctx: &ComparisonContext,
    rows: &mut HashMap<BoardKey, GlickoRow>,
) -> Result<()> {
    let score_first = ctx.outcome.score_for_first();
    let (role_first, role_second) = ctx.outcome.roles();
    let mut staged: HashMap<BoardKey, GlickoRow> = HashMap::new();

    for kind in SubjectKind::ALL {
        pairwise_glicko(
            rows,
            &mut staged,
            ctx.key(ctx.first.subject(kind), None),
            ctx.key(ctx.second.subject(kind), None),
            score_first,
            role_first,
            role_second,
        )?;
    }

    for tag in ctx.shared_tags() {
        for kind in SubjectKind::ALL {
            pairwise_glicko(
                rows,
                &mut staged,
                ctx.key(ctx.first.subject(kind), Some(tag)),
                ctx.key(ctx.second.subject(kind), Some(tag)),
                score_first,
                role_first,
                role_second,
            )?;
        }
    }

    for (key, row) in staged {
        rows.insert(key, row);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Board SQL
// ---------------------------------------------------------------------------

fn board_table(system: RatingSystem, subject: Subject) -> &'static str {
    match (system, subject) {
        (RatingSystem::Elo, Subject::Model(_)) => "scoring.model_leaderboard",
        (RatingSystem::Elo, Subject::Prompt { .. }) => "scoring.prompt_leaderboard",
        (RatingSystem::Elo, Subject::Sample(_)) => "scoring.sample_leaderboard",
        (RatingSystem::Glicko, Subject::Model(_)) => "scoring.model_glicko_leaderboard",
        (RatingSystem::Glicko, Subject::Prompt { .. }) => "scoring.prompt_glicko_leaderboard",
        (RatingSystem::Glicko, Subject::Sample(_)) => "scoring.sample_glicko_leaderboard",
    }
}

fn subject_columns(subject: Subject) -> &'static str {
    match subject {
        Subject::Model(_) => "model_id",
        Subject::Prompt { .. } => "prompt_id, model_id",
        Subject::Sample(_) => "sample_id",
    }
}

fn subject_bind_count(subject: Subject) -> usize {
    match subject {
        Subject::Prompt { .. } => 2,
        _ => 1,
    }
}

fn value_columns(system: RatingSystem) -> &'static str {
    match system {
        RatingSystem::Elo => "elo_score, vote_count, win_count, loss_count, tie_count",
        RatingSystem::Glicko => {
            "glicko_rating, rating_deviation, volatility, vote_count, win_count, loss_count, tie_count"
        }
    }
}

fn select_board_sql(system: RatingSystem, key: &BoardKey) -> String {
    let subject_binds = subject_bind_count(key.subject);
    let predicate = match key.subject {
        Subject::Model(_) => "model_id = $1".to_string(),
        Subject::Prompt { .. } => "prompt_id = $1 AND model_id = $2".to_string(),
        Subject::Sample(_) => "sample_id = $1".to_string(),
    };
    let tag_predicate = if key.tag_id.is_some() {
        format!("tag_id = ${}", subject_binds + 3)
    } else {
        "tag_id IS NULL".to_string()
    };
    format!(
        "SELECT id, {} FROM {} WHERE {} AND metric_id = ${} AND test_set_id = ${} AND {}",
        value_columns(system),
        board_table(system, key.subject),
        predicate,
        subject_binds + 1,
        subject_binds + 2,
        tag_predicate,
    )
}

fn insert_board_sql(system: RatingSystem, subject: Subject) -> String {
    let total_binds = subject_bind_count(subject)
        + 3
        + value_columns(system).split(',').count();
    let placeholders: Vec<String> = (1..=total_binds).map(|i| format!("${i}")).collect();
    format!(
        "INSERT INTO {} ({}, metric_id, test_set_id, tag_id, {}) VALUES ({})",
        board_table(system, subject),
        subject_columns(subject),
        value_columns(system),
        placeholders.join(", "),
    )
}

fn update_board_sql(system: RatingSystem, subject: Subject) -> String {
    let assignments = match system {
        RatingSystem::Elo => {
            "elo_score = $1, vote_count = $2, win_count = $3, loss_count = $4, tie_count = $5, \
             last_updated = now() WHERE id = $6"
        }
        RatingSystem::Glicko => {
            "glicko_rating = $1, rating_deviation = $2, volatility = $3, vote_count = $4, \
             win_count = $5, loss_count = $6, tie_count = $7, last_updated = now() WHERE id = $8"
        }
    };
    format!("UPDATE {} SET {}", board_table(system, subject), assignments)
}

#[derive(Debug, sqlx::FromRow)]
struct EloRowDb {
    id: i64,
    elo_score: f64,
    vote_count: i64,
    win_count: i64,
    loss_count: i64,
    tie_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct GlickoRowDb {
    id: i64,
    glicko_rating: f64,
    rating_deviation: f64,
    volatility: f64,
    vote_count: i64,
    win_count: i64,
    loss_count: i64,
    tie_count: i64,
}

fn bind_subject<'q, O>(
    query: sqlx::query::QueryAs<'q, Postgres, O, sqlx::postgres::PgArguments>,
    subject: Subject,
) -> sqlx::query::QueryAs<'q, Postgres, O, sqlx::postgres::PgArguments> {
    match subject {
        Subject::Model(id) | Subject::Sample(id) => query.bind(id),
        Subject::Prompt {
            prompt_id,
            model_id,
        } => query.bind(prompt_id).bind(model_id),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub processed: u64,
    pub skipped: u64,
    pub batches: u64,
}

pub struct RatingEngine {
    pool: PgPool,
    batch_size: i64,
    telemetry: TelemetrySink,
}

impl RatingEngine {
    pub fn new(pool: PgPool, cfg: &ArenaConfig, telemetry: TelemetrySink) -> Self {
        Self {
            pool,
            batch_size: cfg.rating_batch_size.max(1),
            telemetry,
        }
    }

    /// Drains every unprocessed comparison for the system in id-ordered
    /// batches, then releases the gate. Idempotent across retries: only
    /// marker-less comparisons are picked up, and markers commit atomically
    /// with the board rows they summarize.
    pub async fn run(
        &self,
        system: RatingSystem,
        gate: &dyn SingleFlightGate,
        gate_ttl_secs: u64,
    ) -> Result<RunSummary> {
        let budget = gate_ttl_secs.saturating_sub(WALL_CLOCK_MARGIN_SECS).max(30);
        let deadline = Instant::now() + Duration::from_secs(budget);

        let mut summary = RunSummary::default();
        let result = self.drain(system, deadline, &mut summary).await;

        if let Err(err) = gate.release(system).await {
            tracing::warn!(system = %system, error = %err, "failed to release rating gate");
        }

        result?;
        Ok(summary)
    }

    async fn drain(
        &self,
        system: RatingSystem,
        deadline: Instant,
        summary: &mut RunSummary,
    ) -> Result<()> {
        loop {
            let (fetched, processed, skipped) = self.process_batch(system).await?;
            if fetched == 0 {
                return Ok(());
            }
            summary.batches += 1;
            summary.processed += processed;
            summary.skipped += skipped;

            if processed == 0 {
                // Nothing progressed; remaining comparisons are all broken
                // and stay unmarked for a later retry.
                return Ok(());
            }
            if fetched < self.batch_size as u64 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::warn!(system = %system, "rating run hit wall-clock cap, stopping early");
                return Ok(());
            }
        }
    }

    async fn process_batch(&self, system: RatingSystem) -> Result<(u64, u64, u64)> {
        let mut tx = self.pool.begin().await.context("failed to open rating transaction")?;

        // Table locks keep a second engine of the same system out even if
        // the gate were circumvented; readers are unaffected.
        let boards = match system {
            RatingSystem::Elo => {
                "scoring.model_leaderboard, scoring.prompt_leaderboard, scoring.sample_leaderboard"
            }
            RatingSystem::Glicko => {
                "scoring.model_glicko_leaderboard, scoring.prompt_glicko_leaderboard, \
                 scoring.sample_glicko_leaderboard"
            }
        };
        sqlx::query(&format!(
            "LOCK TABLE scoring.comparison, scoring.processed_comparison, {boards} \
             IN SHARE ROW EXCLUSIVE MODE"
        ))
        .execute(&mut *tx)
        .await?;

        let pending: Vec<PendingComparison> = sqlx::query_as(
            "SELECT c.id, c.metric_id, c.test_set_id FROM scoring.comparison c \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM scoring.processed_comparison pc \
                 WHERE pc.comparison_id = c.id AND pc.rating_system = $1 \
             ) \
             ORDER BY c.id \
             LIMIT $2 \
             FOR UPDATE",
        )
        .bind(system.as_str())
        .bind(self.batch_size)
        .fetch_all(&mut *tx)
        .await?;

        if pending.is_empty() {
            tx.commit().await?;
            return Ok((0, 0, 0));
        }
        let fetched = pending.len() as u64;
        tracing::info!(system = %system, count = fetched, "processing unprocessed comparisons");

        let ids: Vec<i64> = pending.iter().map(|c| c.id).collect();
        let rank_rows: Vec<RankedSampleRow> = sqlx::query_as(
            "SELECT cr.comparison_id, cr.sample_id, cr.rank, r.model_id, r.prompt_id \
             FROM scoring.comparison_rank cr \
             JOIN sample.sample s ON s.id = cr.sample_id \
             JOIN specification.run r ON r.id = s.run_id \
             WHERE cr.comparison_id = ANY($1) \
             ORDER BY cr.comparison_id, cr.rank, cr.id",
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        let mut ranks_by_comparison: HashMap<i64, Vec<RankedSampleRow>> = HashMap::new();
        for row in rank_rows {
            ranks_by_comparison
                .entry(row.comparison_id)
                .or_default()
                .push(row);
        }

        let prompt_ids: Vec<i64> = {
            let set: BTreeSet<i64> = ranks_by_comparison
                .values()
                .flatten()
                .map(|r| r.prompt_id)
                .collect();
            set.into_iter().collect()
        };
        let tag_pairs: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT pt.prompt_id, pt.tag_id FROM specification.prompt_tag pt \
             JOIN specification.tag t ON t.id = pt.tag_id \
             WHERE t.calculate_score AND pt.prompt_id = ANY($1) \
             ORDER BY pt.prompt_id, pt.tag_id",
        )
        .bind(&prompt_ids)
        .fetch_all(&mut *tx)
        .await?;
        let mut tags_by_prompt: HashMap<i64, Vec<i64>> = HashMap::new();
        for (prompt_id, tag_id) in tag_pairs {
            tags_by_prompt.entry(prompt_id).or_default().push(tag_id);
        }

        let mut processed = 0u64;
        let mut skipped = 0u64;

        match system {
            RatingSystem::Elo => {
                let mut rows: HashMap<BoardKey, EloRow> = HashMap::new();
                for comparison in &pending {
                    let ranks = ranks_by_comparison
                        .get(&comparison.id)
                        .map(Vec::as_slice)
                        .unwrap_or_default();
                    let ctx = match build_context(comparison, ranks, &tags_by_prompt) {
                        Ok(ctx) => ctx,
                        Err(err) => {
                            tracing::error!(comparison_id = comparison.id, error = %err, "skipping comparison");
                            self.telemetry
                                .count_rating_error(comparison.id, &format!("{err:#}"));
                            skipped += 1;
                            continue;
                        }
                    };
                    for key in ctx.board_keys() {
                        if !rows.contains_key(&key) {
                            if let Some(loaded) = load_elo_row(&mut tx, &key).await? {
                                rows.insert(key, loaded);
                            }
                        }
                    }
                    apply_elo(&ctx, &mut rows);
                    insert_marker(&mut tx, comparison.id, system).await?;
                    processed += 1;
                }
                flush_elo_rows(&mut tx, &rows).await?;
            }
            RatingSystem::Glicko => {
                let mut rows: HashMap<BoardKey, GlickoRow> = HashMap::new();
                for comparison in &pending {
                    let ranks = ranks_by_comparison
                        .get(&comparison.id)
                        .map(Vec::as_slice)
                        .unwrap_or_default();
                    let ctx = match build_context(comparison, ranks, &tags_by_prompt) {
                        Ok(ctx) => ctx,
                        Err(err) => {
                            tracing::error!(comparison_id = comparison.id, error = %err, "skipping comparison");
                            self.telemetry
                                .count_rating_error(comparison.id, &format!("{err:#}"));
                            skipped += 1;
                            continue;
                        }
                    };
                    for key in ctx.board_keys() {
                        if !rows.contains_key(&key) {
                            if let Some(loaded) = load_glicko_row(&mut tx, &key).await? {
                                rows.insert(key, loaded);
                            }
                        }
                    }
                    match apply_glicko(&ctx, &mut rows) {
                        Ok(()) => {
                            insert_marker(&mut tx, comparison.id, system).await?;
                            processed += 1;
                        }
                        Err(err) => {
                            tracing::error!(comparison_id = comparison.id, error = %err, "glicko update failed, skipping");
                            self.telemetry
                                .count_rating_error(comparison.id, &format!("{err:#}"));
                            skipped += 1;
                        }
                    }
                }
                flush_glicko_rows(&mut tx, &rows).await?;
            }
        }

        tx.commit().await.context("failed to commit rating batch")?;
        Ok((fetched, processed, skipped))
    }
}

async fn insert_marker(
    tx: &mut Transaction<'_, Postgres>,
    comparison_id: i64,
    system: RatingSystem,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO scoring.processed_comparison (comparison_id, rating_system) VALUES ($1, $2)",
    )
    .bind(comparison_id)
    .bind(system.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn load_elo_row(
    tx: &mut Transaction<'_, Postgres>,
    key: &BoardKey,
) -> Result<Option<EloRow>> {
    let sql = select_board_sql(RatingSystem::Elo, key);
    let mut query = sqlx::query_as::<_, EloRowDb>(&sql);
    query = bind_subject(query, key.subject);
    query = query.bind(key.metric_id).bind(key.test_set_id);
    if let Some(tag_id) = key.tag_id {
        query = query.bind(tag_id);
    }
    let row = query.fetch_optional(&mut **tx).await?;
    Ok(row.map(|db| EloRow {
        row_id: Some(db.id),
        rating: db.elo_score,
        votes: db.vote_count,
        wins: db.win_count,
        losses: db.loss_count,
        ties: db.tie_count,
        dirty: false,
    }))
}

async fn load_glicko_row(
    tx: &mut Transaction<'_, Postgres>,
    key: &BoardKey,
) -> Result<Option<GlickoRow>> {
    let sql = select_board_sql(RatingSystem::Glicko, key);
    let mut query = sqlx::query_as::<_, GlickoRowDb>(&sql);
    query = bind_subject(query, key.subject);
    query = query.bind(key.metric_id).bind(key.test_set_id);
    if let Some(tag_id) = key.tag_id {
        query = query.bind(tag_id);
    }
    let row = query.fetch_optional(&mut **tx).await?;
    Ok(row.map(|db| GlickoRow {
        row_id: Some(db.id),
        rating: GlickoRating {
            rating: db.glicko_rating,
            deviation: db.rating_deviation,
            volatility: db.volatility,
        },
        votes: db.vote_count,
        wins: db.win_count,
        losses: db.loss_count,
        ties: db.tie_count,
        dirty: false,
    }))
}

async fn flush_elo_rows(
    tx: &mut Transaction<'_, Postgres>,
    rows: &HashMap<BoardKey, EloRow>,
) -> Result<()> {
    for (key, row) in rows {
        if !row.dirty {
            continue;
        }
        match row.row_id {
            Some(row_id) => {
                let sql = update_board_sql(RatingSystem::Elo, key.subject);
                sqlx::query(&sql)
                    .bind(row.rating)
                    .bind(row.votes)
                    .bind(row.wins)
                    .bind(row.losses)
                    .bind(row.ties)
                    .bind(row_id)
                    .execute(&mut **tx)
                    .await?;
            }
            None => {
                let sql = insert_board_sql(RatingSystem::Elo, key.subject);
                let mut query = sqlx::query(&sql);
                query = match key.subject {
                    Subject::Model(id) | Subject::Sample(id) => query.bind(id),
                    Subject::Prompt {
                        prompt_id,
                        model_id,
                    } => query.bind(prompt_id).bind(model_id),
                };
                query
                    .bind(key.metric_id)
                    .bind(key.test_set_id)
                    .bind(key.tag_id)
                    .bind(row.rating)
                    .bind(row.votes)
                    .bind(row.wins)
                    .bind(row.losses)
                    .bind(row.ties)
                    .execute(&mut **tx)
                    .await?;
            }
        }
    }
    Ok(())
}

async fn flush_glicko_rows(
    tx: &mut Transaction<'_, Postgres>,
    rows: &HashMap<BoardKey, GlickoRow>,
) -> Result<()> {
    for (key, row) in rows {
        if !row.dirty {
            continue;
        }
        match row.row_id {
            Some(row_id) => {
                let sql = update_board_sql(RatingSystem::Glicko, key.subject);
                sqlx::query(&sql)
                    .bind(row.rating.rating)
                    .bind(row.rating.deviation)
                    .bind(row.rating.volatility)
                    .bind(row.votes)
                    .bind(row.wins)
                    .bind(row.losses)
                    .bind(row.ties)
                    .bind(row_id)
                    .execute(&mut **tx)
                    .await?;
            }
            None => {
                let sql = insert_board_sql(RatingSystem::Glicko, key.subject);
                let mut query = sqlx::query(&sql);
                query = match key.subject {
                    Subject::Model(id) | Subject::Sample(id) => query.bind(id),
                    Subject::Prompt {
                        prompt_id,
                        model_id,
                    } => query.bind(prompt_id).bind(model_id),
                };
                query
                    .bind(key.metric_id)
                    .bind(key.test_set_id)
                    .bind(key.tag_id)
                    .bind(row.rating.rating)
                    .bind(row.rating.deviation)
                    .bind(row.rating.volatility)
                    .bind(row.votes)
                    .bind(row.wins)
                    .bind(row.losses)
                    .bind(row.ties)
                    .execute(&mut **tx)
                    .await?;
            }
        }
    }
    Ok(())
}
