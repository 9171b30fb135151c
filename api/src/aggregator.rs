//! Per-muscle volume and training status, computed from persisted rows.
//!
//! Nothing here writes. The only state is a short-lived tracking cache that
//! is dropped for a user whenever one of their sessions closes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use liftlog_core::aggregates::{
    MuscleTracking, MuscleVolumeBucket, SessionFrequency, StatusPolicy, VolumeProgression,
    VolumeWindow, aggregate_tracking, aggregate_volume, session_frequency, volume_progression,
};

use crate::store::{StoreError, WorkoutStore};

struct CachedTracking {
    computed_at: Instant,
    rows: Vec<MuscleTracking>,
}

#[derive(Default)]
struct TrackingCache {
    /// Bumped on every invalidation. Rows computed under an older epoch may
    /// predate the write that invalidated them and are not cached.
    epoch: u64,
    entries: HashMap<(Uuid, u32), CachedTracking>,
}

impl TrackingCache {
    fn fresh(&self, key: &(Uuid, u32), ttl: Duration) -> Option<&[MuscleTracking]> {
        self.entries
            .get(key)
            .filter(|entry| entry.computed_at.elapsed() < ttl)
            .map(|entry| entry.rows.as_slice())
    }

    /// Cache `rows` unless an invalidation happened since `epoch` was read.
    /// Expired entries are evicted on every write.
    fn store_if_current(
        &mut self,
        key: (Uuid, u32),
        epoch: u64,
        rows: Vec<MuscleTracking>,
        ttl: Duration,
    ) -> bool {
        if epoch != self.epoch {
            return false;
        }
        self.entries.retain(|_, entry| entry.computed_at.elapsed() < ttl);
        self.entries.insert(
            key,
            CachedTracking {
                computed_at: Instant::now(),
                rows,
            },
        );
        true
    }

    fn invalidate(&mut self, user_id: Uuid) -> usize {
        self.epoch = self.epoch.wrapping_add(1);
        let before = self.entries.len();
        self.entries.retain(|(cached_user, _), _| *cached_user != user_id);
        before - self.entries.len()
    }
}

#[derive(Clone)]
pub struct MuscleVolumeAggregator {
    store: Arc<dyn WorkoutStore>,
    policy: StatusPolicy,
    cache_ttl: Duration,
    tracking_cache: Arc<RwLock<TrackingCache>>,
}

impl MuscleVolumeAggregator {
    pub fn new(store: Arc<dyn WorkoutStore>, policy: StatusPolicy, cache_ttl: Duration) -> Self {
        Self {
            store,
            policy,
            cache_ttl,
            tracking_cache: Arc::new(RwLock::new(TrackingCache::default())),
        }
    }

    pub fn policy(&self) -> &StatusPolicy {
        &self.policy
    }

    /// Volume per muscle per calendar date over the window.
    pub async fn get_volume(
        &self,
        user_id: Uuid,
        window: VolumeWindow,
    ) -> Result<Vec<MuscleVolumeBucket>, StoreError> {
        self.volume_at(user_id, window, Utc::now()).await
    }

    async fn volume_at(
        &self,
        user_id: Uuid,
        window: VolumeWindow,
        now: DateTime<Utc>,
    ) -> Result<Vec<MuscleVolumeBucket>, StoreError> {
        let facts = self.store.activation_facts(user_id, window.since(now)).await?;
        Ok(aggregate_volume(&facts))
    }

    /// Volume, exercise count and status per muscle over the last `days` days.
    pub async fn get_tracking(&self, user_id: Uuid, days: u32) -> Result<Vec<MuscleTracking>, StoreError> {
        let key = (user_id, days);
        let epoch = {
            let cache = self.tracking_cache.read().await;
            if let Some(rows) = cache.fresh(&key, self.cache_ttl) {
                tracing::debug!(user_id = %user_id, days, "tracking cache hit");
                return Ok(rows.to_vec());
            }
            cache.epoch
        };

        let now = Utc::now();
        let facts = self
            .store
            .activation_facts(user_id, VolumeWindow::Days(days).since(now))
            .await?;
        let rows = aggregate_tracking(&facts, now, &self.policy);

        if !self.cache_ttl.is_zero() {
            let stored = self.tracking_cache.write().await.store_if_current(
                key,
                epoch,
                rows.clone(),
                self.cache_ttl,
            );
            if !stored {
                tracing::debug!(user_id = %user_id, days, "tracking invalidated while computing, not cached");
            }
        }
        Ok(rows)
    }

    /// Drop every cached tracking window for the user.
    pub async fn invalidate(&self, user_id: Uuid) {
        let dropped = self.tracking_cache.write().await.invalidate(user_id);
        if dropped > 0 {
            tracing::debug!(user_id = %user_id, dropped, "tracking cache invalidated");
        }
    }

    pub async fn get_volume_progression(
        &self,
        user_id: Uuid,
        window: VolumeWindow,
    ) -> Result<VolumeProgression, StoreError> {
        let buckets = self.get_volume(user_id, window).await?;
        Ok(volume_progression(&buckets, window.days()))
    }

    pub async fn get_frequency(&self, user_id: Uuid, days: u32) -> Result<SessionFrequency, StoreError> {
        let since = VolumeWindow::Days(days).since(Utc::now());
        let starts = self.store.completed_session_starts(user_id, since).await?;
        Ok(session_frequency(&starts))
    }
}
