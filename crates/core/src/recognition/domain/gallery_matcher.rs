use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::shared::embedding::Embedding;

use super::gallery::Gallery;
use super::gallery_source::{GalleryLoadError, GallerySource};

/// What a `maybe_refresh` call did.
#[derive(Clone, Debug, PartialEq)]
pub enum RefreshOutcome {
    /// Snapshot still fresh and no refresh was requested.
    Skipped,
    Refreshed { entries: usize },
    /// The source failed; the previous snapshot stays in force.
    Failed(String),
}

/// Nearest-identity search over a refreshable gallery snapshot.
///
/// Readers clone the current `Arc<Gallery>` under a read lock held only for
/// the clone, then scan without any lock. A refresh builds a complete new
/// snapshot before swapping it in, so a reader sees either the old set or
/// the new one, never a mix.
pub struct GalleryMatcher {
    source: Arc<dyn GallerySource>,
    snapshot: RwLock<Arc<Gallery>>,
    threshold: f32,
    ttl: Duration,
    force_refresh: AtomicBool,
    refresh_lock: Mutex<()>,
}

impl GalleryMatcher {
    /// Performs the initial load. Fails if the source errors or yields no
    /// usable entries, since there is no snapshot to fall back on.
    pub fn load(
        source: Arc<dyn GallerySource>,
        threshold: f32,
        ttl: Duration,
    ) -> Result<Self, GalleryLoadError> {
        let faces = source.list_known_embeddings()?;
        let gallery = Gallery::build(faces, Instant::now(), ttl)?;
        log::info!(
            "Loaded {} known faces ({}-d) from {}",
            gallery.len(),
            gallery.dimension(),
            source.describe()
        );
        Ok(Self {
            source,
            snapshot: RwLock::new(Arc::new(gallery)),
            threshold,
            ttl,
            force_refresh: AtomicBool::new(false),
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> Arc<Gallery> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Best candidate at or above the recognition threshold, plus the
    /// highest similarity seen (reported even when no candidate qualifies).
    pub fn best_match(&self, embedding: &Embedding) -> (Option<String>, f32) {
        let gallery = self.snapshot();
        match gallery.nearest(embedding) {
            Some((entry, sim)) if sim >= self.threshold => (Some(entry.student_id.clone()), sim),
            Some((_, sim)) => (None, sim),
            None => (None, 0.0),
        }
    }

    /// Reloads from the source and swaps the snapshot in on success.
    ///
    /// On failure the current snapshot keeps serving.
    pub fn refresh(&self) -> Result<usize, GalleryLoadError> {
        let _writer = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let faces = self.source.list_known_embeddings()?;
        let gallery = Gallery::build(faces, Instant::now(), self.ttl)?;
        let entries = gallery.len();

        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(gallery);
        log::info!("Gallery refreshed: {entries} known faces");
        Ok(entries)
    }

    /// Refreshes when the snapshot has outlived its TTL or a refresh was
    /// requested. Errors are reported in the outcome, never raised.
    pub fn maybe_refresh(&self, now: Instant) -> RefreshOutcome {
        let forced = self.force_refresh.swap(false, Ordering::AcqRel);
        if !forced && !self.snapshot().is_expired(now) {
            return RefreshOutcome::Skipped;
        }
        match self.refresh() {
            Ok(entries) => RefreshOutcome::Refreshed { entries },
            Err(e) => {
                log::warn!("Gallery refresh failed, serving stale snapshot: {e}");
                RefreshOutcome::Failed(e.to_string())
            }
        }
    }

    /// Forces the next `maybe_refresh` to reload.
    pub fn request_refresh(&self) {
        self.force_refresh.store(true, Ordering::Release);
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}
