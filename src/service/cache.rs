//! Bounded cache of result images
//!
//! Entries are evicted strictly in insertion order, one per overflow.
//! Reads never refresh an entry.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Local;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::engine::Label;
use crate::error::{EngineError, Result};

use super::types::{ImageIds, ImageKind, ListFilter};

/// A cached PNG image
#[derive(Debug)]
pub struct CacheEntry {
    pub id: String,
    pub kind: ImageKind,
    pub label: Label,
    pub payload: Arc<[u8]>,
    pub insertion_order: u64,
}

struct Inner {
    capacity: usize,
    entries: HashMap<String, Arc<CacheEntry>>,
    /// Ids oldest first
    order: VecDeque<String>,
    next_order: u64,
}

impl Inner {
    fn insert(&mut self, id: String, kind: ImageKind, label: Label, payload: Arc<[u8]>) {
        let entry = Arc::new(CacheEntry {
            id: id.clone(),
            kind,
            label,
            payload,
            insertion_order: self.next_order,
        });
        self.next_order += 1;
        self.entries.insert(id.clone(), entry);
        self.order.push_back(id);
        self.evict();
    }

    fn evict(&mut self) {
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                debug!("Evicted cached image {}", oldest);
            }
        }
    }
}

pub struct ResultCache {
    inner: RwLock<Inner>,
    seq: AtomicU64,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                capacity: capacity.max(1),
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_order: 0,
            }),
            seq: AtomicU64::new(0),
        }
    }

    /// Fresh stem `{label}_{timestamp}_{seq}{rand}`
    fn next_stem(&self, label: Label) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) & 0xffff;
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}_{}_{:04x}{}",
            label,
            Local::now().format("%Y%m%d%H%M%S%3f"),
            seq,
            &suffix[..4]
        )
    }

    /// Store one image and return its id.
    pub fn put(&self, kind: ImageKind, label: Label, payload: Arc<[u8]>) -> String {
        let id = format!("{}_{}", kind.prefix(), self.next_stem(label));
        self.inner.write().insert(id.clone(), kind, label, payload);
        id
    }

    /// Store the original and overlay of one prediction under a shared stem.
    ///
    /// Returns the stem and both ids.
    pub fn put_result(
        &self,
        label: Label,
        original: Arc<[u8]>,
        overlay: Arc<[u8]>,
    ) -> (String, ImageIds) {
        let stem = self.next_stem(label);
        let ids = ImageIds {
            original: format!("{}_{}", ImageKind::Original.prefix(), stem),
            overlay: format!("{}_{}", ImageKind::Overlay.prefix(), stem),
        };

        let mut inner = self.inner.write();
        inner.insert(ids.original.clone(), ImageKind::Original, label, original);
        inner.insert(ids.overlay.clone(), ImageKind::Overlay, label, overlay);
        drop(inner);

        (stem, ids)
    }

    pub fn get(&self, id: &str) -> Result<Arc<CacheEntry>> {
        self.inner
            .read()
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("image '{}'", id)))
    }

    /// Ids matching `filter`, newest first unless reversed.
    pub fn list(&self, filter: &ListFilter) -> Vec<String> {
        let inner = self.inner.read();
        let matches = |id: &&String| {
            let prefix_ok = filter
                .prefix
                .as_deref()
                .map_or(true, |prefix| id.starts_with(prefix));
            let label_ok = filter.label.map_or(true, |label| {
                inner.entries.get(*id).map_or(false, |e| e.label == label)
            });
            prefix_ok && label_ok
        };

        if filter.reverse {
            inner.order.iter().filter(matches).take(filter.limit).cloned().collect()
        } else {
            inner.order.iter().rev().filter(matches).take(filter.limit).cloned().collect()
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        let removed = inner.order.len();
        inner.entries.clear();
        inner.order.clear();
        debug!("Cleared {} cached images", removed);
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().capacity
    }

    /// Change capacity, evicting the oldest entries if it shrinks.
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.write();
        inner.capacity = capacity.max(1);
        inner.evict();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(byte: u8) -> Arc<[u8]> {
        Arc::from(vec![byte])
    }

    #[test]
    fn test_fifo_eviction_scenario() {
        let cache = ResultCache::new(2);
        let a = cache.put(ImageKind::Original, Label::OK, payload(1));
        let b = cache.put(ImageKind::Original, Label::OK, payload(2));
        // Reading A does not protect it
        cache.get(&a).unwrap();
        let c = cache.put(ImageKind::Original, Label::NG, payload(3));

        assert_eq!(cache.len(), 2);
        assert!(matches!(cache.get(&a), Err(EngineError::NotFound(_))));
        assert_eq!(&cache.get(&b).unwrap().payload[..], &[2]);
        assert_eq!(&cache.get(&c).unwrap().payload[..], &[3]);
    }

    #[test]
    fn test_id_format() {
        let cache = ResultCache::new(10);
        let (stem, ids) = cache.put_result(Label::NG, payload(1), payload(2));
        assert_eq!(ids.original, format!("org_{}", stem));
        assert_eq!(ids.overlay, format!("ovr_{}", stem));

        let parts: Vec<&str> = stem.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "NG");
        assert_eq!(parts[1].len(), 17);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 8);
        assert_eq!(&parts[2][..4], "0000");
    }

    #[test]
    fn test_ids_unique() {
        let cache = ResultCache::new(1000);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let id = cache.put(ImageKind::Overlay, Label::OK, payload(0));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_list_order_and_filters() {
        let cache = ResultCache::new(10);
        let (_, first) = cache.put_result(Label::OK, payload(1), payload(2));
        let (_, second) = cache.put_result(Label::NG, payload(3), payload(4));

        let all = cache.list(&ListFilter::default());
        assert_eq!(
            all,
            vec![
                second.overlay.clone(),
                second.original.clone(),
                first.overlay.clone(),
                first.original.clone()
            ]
        );

        let originals = cache.list(&ListFilter {
            prefix: Some("org_".to_string()),
            reverse: true,
            ..ListFilter::default()
        });
        assert_eq!(originals, vec![first.original.clone(), second.original.clone()]);

        let ng = cache.list(&ListFilter {
            label: Some(Label::NG),
            limit: 1,
            ..ListFilter::default()
        });
        assert_eq!(ng, vec![second.overlay]);
    }

    #[test]
    fn test_put_result_counts_two_entries() {
        let cache = ResultCache::new(3);
        cache.put_result(Label::OK, payload(1), payload(2));
        let (_, ids) = cache.put_result(Label::OK, payload(3), payload(4));
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&ids.original).is_ok());
        assert!(cache.get(&ids.overlay).is_ok());
    }

    #[test]
    fn test_clear_and_shrink() {
        let cache = ResultCache::new(4);
        for i in 0..4 {
            cache.put(ImageKind::Original, Label::OK, payload(i));
        }
        cache.set_capacity(2);
        assert_eq!(cache.len(), 2);
        let remaining = cache.list(&ListFilter::default());
        assert_eq!(&cache.get(&remaining[0]).unwrap().payload[..], &[3]);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.list(&ListFilter::default()).is_empty());
    }
}
