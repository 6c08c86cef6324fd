// src/counters.rs
//! View/like counters.
//!
//! Increments go to the ephemeral buffer only; `flush` folds the buffer into
//! the `recipes` counter columns. Readers add both together.
//!
//! A flush drains the buffer before applying the deltas. If the process dies
//! between the two, the deltas not yet applied are lost. That window is
//! accepted for vanity counters and is not worth a two-phase protocol.
use crate::ephemeral::{EphemeralCounterStore, PendingDelta};
use crate::error::{AppError, AppResult};
use crate::models::{CounterMetric, RecipeCounts};
use crate::store::{LikeStore, RecipeStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LikeOutcome {
    Liked,
    AlreadyLiked,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Another flush held the guard; nothing was done.
    pub skipped: bool,
    pub applied: usize,
    pub requeued: usize,
    pub dropped: usize,
}

pub struct CounterService {
    ephemeral: Arc<dyn EphemeralCounterStore>,
    recipes: Arc<dyn RecipeStore>,
    likes: Arc<dyn LikeStore>,
    flush_lock_ttl: Duration,
}

impl CounterService {
    pub fn new(
        ephemeral: Arc<dyn EphemeralCounterStore>,
        recipes: Arc<dyn RecipeStore>,
        likes: Arc<dyn LikeStore>,
        flush_lock_ttl: Duration,
    ) -> Self {
        Self {
            ephemeral,
            recipes,
            likes,
            flush_lock_ttl,
        }
    }

    pub async fn record_view(&self, recipe_id: Uuid) {
        self.record(CounterMetric::View, recipe_id).await
    }

    pub async fn record_like(&self, recipe_id: Uuid) {
        self.record(CounterMetric::Like, recipe_id).await
    }

    // A lost increment is acceptable; never fail the request over it.
    async fn record(&self, metric: CounterMetric, recipe_id: Uuid) {
        if let Err(e) = self.ephemeral.increment(metric, recipe_id, 1).await {
            tracing::warn!(%metric, %recipe_id, error = %e, "Failed to buffer counter increment");
        }
    }

    /// The only way a like is counted: the (user, recipe) row decides.
    pub async fn like_recipe(&self, user_id: Uuid, recipe_id: Uuid) -> AppResult<LikeOutcome> {
        if self.recipes.durable_counts(recipe_id).await?.is_none() {
            return Err(AppError::not_found("Recipe not found"));
        }

        if !self.likes.insert_like(user_id, recipe_id).await? {
            tracing::debug!(%user_id, %recipe_id, "Duplicate like ignored");
            return Ok(LikeOutcome::AlreadyLiked);
        }

        self.record_like(recipe_id).await;
        Ok(LikeOutcome::Liked)
    }

    pub async fn has_liked(&self, user_id: Uuid, recipe_id: Uuid) -> AppResult<bool> {
        self.likes.has_liked(user_id, recipe_id).await
    }

    pub async fn liked_recipes(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        self.likes.liked_recipe_ids(user_id).await
    }

    async fn pending_or_zero(&self, recipe_id: Uuid) -> RecipeCounts {
        match self.ephemeral.pending_counts(recipe_id).await {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!(%recipe_id, error = %e, "Counter buffer unavailable, showing durable counts");
                RecipeCounts::default()
            }
        }
    }

    /// Durable plus buffered totals for a recipe.
    pub async fn combined_counts(&self, recipe_id: Uuid) -> AppResult<RecipeCounts> {
        let mut counts = self
            .recipes
            .durable_counts(recipe_id)
            .await?
            .ok_or_else(|| AppError::not_found("Recipe not found"))?;
        let pending = self.pending_or_zero(recipe_id).await;
        for metric in CounterMetric::ALL {
            counts.add(metric, pending.get(metric));
        }
        Ok(counts)
    }

    pub async fn read_combined_count(
        &self,
        recipe_id: Uuid,
        metric: CounterMetric,
    ) -> AppResult<i64> {
        Ok(self.combined_counts(recipe_id).await?.get(metric))
    }

    /// Folds every buffered delta into the durable store. At most one flush
    /// runs at a time; a concurrent call returns a skipped report.
    pub async fn flush(&self) -> AppResult<FlushReport> {
        let Some(lease) = self
            .ephemeral
            .try_acquire_flush_lock(self.flush_lock_ttl)
            .await?
        else {
            tracing::info!("Counter flush already in progress, skipping");
            return Ok(FlushReport {
                skipped: true,
                ..FlushReport::default()
            });
        };

        let result = self.drain_and_apply().await;

        if let Err(e) = self.ephemeral.release_flush_lock(lease).await {
            tracing::error!(error = %e, "Failed to release counter flush lock");
        }
        result
    }

    async fn drain_and_apply(&self) -> AppResult<FlushReport> {
        let deltas = self.ephemeral.drain().await?;
        let mut report = FlushReport::default();

        for PendingDelta {
            metric,
            recipe_id,
            delta,
        } in deltas
        {
            match self.recipes.apply_counter_delta(recipe_id, metric, delta).await {
                Ok(true) => report.applied += 1,
                Ok(false) => {
                    tracing::warn!(%metric, %recipe_id, delta, "Dropping counter delta for missing recipe");
                    report.dropped += 1;
                }
                Err(e) => {
                    tracing::error!(%metric, %recipe_id, delta, error = %e, "Failed to apply counter delta");
                    match self.ephemeral.increment(metric, recipe_id, delta).await {
                        Ok(()) => report.requeued += 1,
                        Err(requeue_err) => {
                            tracing::error!(%metric, %recipe_id, delta, error = %requeue_err, "Counter delta lost");
                            report.dropped += 1;
                        }
                    }
                }
            }
        }

        tracing::info!(
            applied = report.applied,
            requeued = report.requeued,
            dropped = report.dropped,
            "Counter flush finished"
        );
        Ok(report)
    }
}
