//! Cross-file, cross-log-type address aggregation.

use std::collections::HashMap;

/// Composite offense count (and first-seen country) for one address,
/// summed across every log file of every log type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateEntry {
    pub count: u64,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    by_addr: HashMap<String, AggregateEntry>,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one more (address, count, country) observation. The
    /// country stored is the first one ever seen for this address;
    /// divergent later observations are ignored here (the caller, e.g.
    /// [`crate::cache::CacheRecord::map_into`], is responsible for any
    /// divergence diagnostics).
    pub fn add(&mut self, addr: &str, count: u64, country: Option<String>) {
        let entry = self.by_addr.entry(addr.to_string()).or_insert(AggregateEntry {
            count: 0,
            country: None,
        });
        entry.count += count;
        if entry.country.is_none() {
            entry.country = country;
        }
    }

    pub fn get(&self, addr: &str) -> Option<&AggregateEntry> {
        self.by_addr.get(addr)
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// All entries sorted descending by count; ties broken ascending by
    /// address string for deterministic, reproducible output.
    pub fn into_sorted_desc(self) -> Vec<(String, AggregateEntry)> {
        let mut v: Vec<_> = self.by_addr.into_iter().collect();
        v.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(&b.0)));
        v
    }

    /// Group by country code (`"--"` standing in for "no country"),
    /// summing counts, sorted descending.
    pub fn by_country_desc(&self) -> Vec<(String, u64)> {
        let mut totals: HashMap<String, u64> = HashMap::new();
        for entry in self.by_addr.values() {
            let code = entry.country.clone().unwrap_or_else(|| "--".to_string());
            *totals.entry(code).or_insert(0) += entry.count;
        }
        let mut v: Vec<_> = totals.into_iter().collect();
        v.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_across_multiple_adds() {
        let mut agg = Aggregate::new();
        agg.add("1.2.3.4", 2, Some("US".into()));
        agg.add("1.2.3.4", 3, Some("GB".into()));
        let e = agg.get("1.2.3.4").unwrap();
        assert_eq!(e.count, 5);
        assert_eq!(e.country.as_deref(), Some("US")); // first seen wins
    }

    #[test]
    fn sort_is_deterministic_on_ties() {
        let mut agg = Aggregate::new();
        agg.add("2.2.2.2", 5, None);
        agg.add("1.1.1.1", 5, None);
        agg.add("9.9.9.9", 9, None);
        let sorted = agg.into_sorted_desc();
        let addrs: Vec<_> = sorted.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(addrs, vec!["9.9.9.9", "1.1.1.1", "2.2.2.2"]);
    }

    #[test]
    fn by_country_groups_and_sums() {
        let mut agg = Aggregate::new();
        agg.add("1.1.1.1", 3, Some("US".into()));
        agg.add("2.2.2.2", 4, Some("US".into()));
        agg.add("3.3.3.3", 1, None);
        let by_country = agg.by_country_desc();
        assert_eq!(by_country[0], ("US".to_string(), 7));
        assert_eq!(by_country[1], ("--".to_string(), 1));
    }
}
