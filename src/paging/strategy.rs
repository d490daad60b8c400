//! Expiration Strategies
//!
//! Decides which page is least valuable. Eviction takes the first page of
//! the sorted snapshot that still holds tiles.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::page::TilePage;
use crate::error::{Error, Result};

/// Page comparison used by [`ExpirationStrategy::Custom`]
pub type PageComparator = Arc<dyn Fn(&TilePage, &TilePage) -> Ordering + Send + Sync>;

/// Eviction order of pages
#[derive(Clone, Default)]
pub enum ExpirationStrategy {
    /// Oldest access first; fewer hits break ties
    #[default]
    LeastRecentlyUsed,
    /// Fewest hits first; older access breaks ties
    LeastFrequentlyUsed,
    /// Earliest created page first
    FirstInFirstOut,
    /// Caller supplied ordering
    Custom { name: String, compare: PageComparator },
}

impl ExpirationStrategy {
    /// Custom strategy from a comparator
    pub fn custom<F>(name: impl Into<String>, compare: F) -> Self
    where
        F: Fn(&TilePage, &TilePage) -> Ordering + Send + Sync + 'static,
    {
        ExpirationStrategy::Custom {
            name: name.into(),
            compare: Arc::new(compare),
        }
    }

    /// Policy name
    pub fn name(&self) -> &str {
        match self {
            ExpirationStrategy::LeastRecentlyUsed => "LRU",
            ExpirationStrategy::LeastFrequentlyUsed => "LFU",
            ExpirationStrategy::FirstInFirstOut => "FIFO",
            ExpirationStrategy::Custom { name, .. } => name,
        }
    }

    pub fn compare(&self, a: &TilePage, b: &TilePage) -> Ordering {
        match self {
            ExpirationStrategy::LeastRecentlyUsed => a
                .last_access_minutes()
                .cmp(&b.last_access_minutes())
                .then_with(|| a.num_hits().cmp(&b.num_hits())),
            ExpirationStrategy::LeastFrequentlyUsed => a
                .num_hits()
                .cmp(&b.num_hits())
                .then_with(|| a.last_access_minutes().cmp(&b.last_access_minutes())),
            ExpirationStrategy::FirstInFirstOut => a.sequence().cmp(&b.sequence()),
            ExpirationStrategy::Custom { compare, .. } => compare(a, b),
        }
    }

    /// Sort a page snapshot into eviction order (stable)
    pub fn sort_pages(&self, pages: &mut [TilePage]) {
        pages.sort_by(|a, b| self.compare(a, b));
    }
}

impl fmt::Debug for ExpirationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExpirationStrategy").field(&self.name()).finish()
    }
}

impl fmt::Display for ExpirationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExpirationStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LRU" => Ok(ExpirationStrategy::LeastRecentlyUsed),
            "LFU" => Ok(ExpirationStrategy::LeastFrequentlyUsed),
            "FIFO" => Ok(ExpirationStrategy::FirstInFirstOut),
            other => Err(Error::Config(format!(
                "unknown expiration policy '{}' (expected LRU, LFU or FIFO)",
                other
            ))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::page::PageIndex;

    fn page(x: u32, hits: u64, last_access: u32) -> TilePage {
        TilePage::with_stats(PageIndex::new(x, 0, 0), hits, 1, last_access)
    }

    fn order(strategy: &ExpirationStrategy, mut pages: Vec<TilePage>) -> Vec<u32> {
        strategy.sort_pages(&mut pages);
        pages.iter().map(|p| p.index().x).collect()
    }

    #[test]
    fn test_lru_order() {
        let pages = vec![page(0, 1, 30), page(1, 50, 10), page(2, 5, 10), page(3, 0, 20)];
        assert_eq!(order(&ExpirationStrategy::LeastRecentlyUsed, pages), vec![2, 1, 3, 0]);
    }

    #[test]
    fn test_lfu_order() {
        let pages = vec![page(0, 1, 30), page(1, 50, 10), page(2, 1, 10), page(3, 0, 20)];
        assert_eq!(order(&ExpirationStrategy::LeastFrequentlyUsed, pages), vec![3, 2, 0, 1]);
    }

    #[test]
    fn test_fifo_order() {
        let pages = vec![
            page(0, 9, 9).with_sequence(2),
            page(1, 0, 0).with_sequence(1),
            page(2, 5, 5).with_sequence(0),
        ];
        assert_eq!(order(&ExpirationStrategy::FirstInFirstOut, pages), vec![2, 1, 0]);
    }

    #[test]
    fn test_sort_is_stable() {
        let pages = vec![page(7, 1, 1), page(3, 1, 1), page(5, 1, 1)];
        assert_eq!(order(&ExpirationStrategy::LeastRecentlyUsed, pages), vec![7, 3, 5]);
    }

    #[test]
    fn test_custom_strategy() {
        let largest_x_first =
            ExpirationStrategy::custom("XDESC", |a: &TilePage, b: &TilePage| {
                b.index().x.cmp(&a.index().x)
            });
        let pages = vec![page(1, 0, 0), page(9, 0, 0), page(4, 0, 0)];
        assert_eq!(order(&largest_x_first, pages), vec![9, 4, 1]);
        assert_eq!(largest_x_first.name(), "XDESC");
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("lru".parse::<ExpirationStrategy>().unwrap().name(), "LRU");
        assert_eq!("LFU".parse::<ExpirationStrategy>().unwrap().name(), "LFU");
        assert_eq!(" fifo ".parse::<ExpirationStrategy>().unwrap().name(), "FIFO");
        assert!("MRU".parse::<ExpirationStrategy>().is_err());
    }
}
