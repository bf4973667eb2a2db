use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use crate::models::category::normalize_name;
use crate::models::{CategoryKey, CategoryRegistry};

/// Keyword matches per normalized name (LRU with 10k max entries)
const CACHE_CAPACITY: usize = 10_000;

/// Maps display names onto registry categories
pub struct ChannelClassifier {
    registry: Arc<CategoryRegistry>,
    cache: Mutex<LruCache<String, Option<CategoryKey>>>,
}

impl ChannelClassifier {
    pub fn new(registry: Arc<CategoryRegistry>) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            registry,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn registry(&self) -> &CategoryRegistry {
        &self.registry
    }

    /// Classify a freshly ingested channel.
    /// Keywords in the name win, then the source group title, then the fallback.
    pub fn classify(&self, display_name: &str, group_hint: Option<&str>) -> CategoryKey {
        let normalized = normalize_name(display_name);
        if let Some(key) = self.match_cached(&normalized) {
            return key;
        }
        if let Some(key) = group_hint.and_then(|g| self.registry.resolve(g)) {
            return key;
        }
        self.registry.fallback().clone()
    }

    /// Classify a channel read back from a shard.
    /// The persisted section label is trusted first; legacy or hand-edited
    /// labels fall through to keyword classification.
    pub fn resolve_or_classify(&self, group_title: Option<&str>, display_name: &str) -> CategoryKey {
        if let Some(key) = group_title.and_then(|g| self.registry.resolve(g)) {
            return key;
        }
        self.classify(display_name, None)
    }

    /// Religious, test and advertising channels kept out of the pool
    pub fn is_excluded(&self, display_name: &str) -> bool {
        self.registry.is_excluded(&normalize_name(display_name))
    }

    fn match_cached(&self, normalized: &str) -> Option<CategoryKey> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(normalized) {
                return hit.clone();
            }
        }

        let result = self.registry.match_keywords(normalized);

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(normalized.to_string(), result.clone());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::category::test_registry;

    fn builtin_classifier() -> ChannelClassifier {
        ChannelClassifier::new(Arc::new(CategoryRegistry::builtin().unwrap()))
    }

    #[test]
    fn test_keywords_win_over_group() {
        let classifier = builtin_classifier();
        let key = classifier.classify("ESPN 2 HD", Some("Peliculas"));
        assert_eq!(key.as_str(), "deportes");
    }

    #[test]
    fn test_group_hint_when_no_keyword() {
        let classifier = builtin_classifier();
        let key = classifier.classify("Zeta XYZ", Some("series"));
        assert_eq!(key.as_str(), "series");
    }

    #[test]
    fn test_fallback_when_nothing_matches() {
        let classifier = builtin_classifier();
        let key = classifier.classify("Zzz 123", Some("Grupo Raro"));
        assert_eq!(key, *classifier.registry().fallback());
    }

    #[test]
    fn test_cached_result_is_stable() {
        let classifier = builtin_classifier();
        let first = classifier.classify("TyC Sports", None);
        let second = classifier.classify("TyC Sports", None);
        assert_eq!(first, second);
        assert_eq!(first.as_str(), "tv_argentina");
    }

    #[test]
    fn test_persisted_label_trusted() {
        let classifier = ChannelClassifier::new(Arc::new(test_registry(&["misc", "news"])));
        let key = classifier.resolve_or_classify(Some("★ NEWS ★"), "anything");
        assert_eq!(key.as_str(), "news");

        let key = classifier.resolve_or_classify(Some("unknown label"), "anything");
        assert_eq!(key.as_str(), "misc");
    }

    #[test]
    fn test_exclusions() {
        let classifier = builtin_classifier();
        assert!(!classifier.is_excluded("Telefe"));
    }
}
