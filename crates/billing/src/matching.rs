//! App-user id candidates and product id matching
//!
//! Product ids reach us in two spellings: storefront ids (`com.example.credits_100`)
//! and provider package keys (`$rc_credits_100`). Matching runs an exact pass first
//! and only falls back to comparing suffix keys when nothing matched exactly.

use creditline_shared::CreditPackage;

/// Ordered, de-duplicated list of app-user ids to try against the provider
///
/// Blank entries are skipped and surrounding whitespace is trimmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppUserCandidates(Vec<String>);

impl AppUserCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id` unless it is blank or already present
    pub fn push(&mut self, id: &str) -> &mut Self {
        let id = id.trim();
        if !id.is_empty() && !self.0.iter().any(|existing| existing == id) {
            self.0.push(id.to_string());
        }
        self
    }

    pub fn push_opt(&mut self, id: Option<&str>) -> &mut Self {
        if let Some(id) = id {
            self.push(id);
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.clone()
    }
}

impl<'a> FromIterator<&'a str> for AppUserCandidates {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut candidates = Self::new();
        for id in iter {
            candidates.push(id);
        }
        candidates
    }
}

impl std::fmt::Display for AppUserCandidates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join(", "))
    }
}

/// How well two product ids matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchRank {
    Exact,
    Suffix,
}

/// Segment after the last `.`, with a leading `$rc_` removed
///
/// `com.example.credits_100` and `$rc_credits_100` both reduce to `credits_100`.
pub fn product_suffix_key(product_id: &str) -> &str {
    let tail = product_id
        .rsplit_once('.')
        .map(|(_, tail)| tail)
        .unwrap_or(product_id);
    tail.strip_prefix("$rc_").unwrap_or(tail)
}

/// Rank the match between two product ids, `None` when they are unrelated
pub fn match_rank(a: &str, b: &str) -> Option<MatchRank> {
    let (a, b) = (a.trim(), b.trim());
    if a.is_empty() || b.is_empty() {
        return None;
    }
    if a == b {
        return Some(MatchRank::Exact);
    }
    let (ka, kb) = (product_suffix_key(a), product_suffix_key(b));
    if !ka.is_empty() && ka == kb {
        return Some(MatchRank::Suffix);
    }
    None
}

/// Best rank between `product_id` and any of `keys`
fn best_rank<'k>(product_id: &str, keys: impl Iterator<Item = &'k str>) -> Option<MatchRank> {
    keys.filter_map(|key| match_rank(product_id, key)).min()
}

/// Find the catalog package for the first product id that maps
///
/// Each requested id is tried in order. For one id, an exact match on any package
/// wins over a suffix match; among suffix matches the first package in catalog
/// order wins.
pub fn find_package<'p>(packages: &'p [CreditPackage], product_ids: &[&str]) -> Option<&'p CreditPackage> {
    product_ids.iter().find_map(|product_id| {
        packages
            .iter()
            .filter_map(|pkg| best_rank(product_id, pkg.product_keys()).map(|rank| (rank, pkg)))
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, pkg)| pkg)
    })
}

/// Pick items matching `product_id`, preferring the exact pass when it is non-empty
pub fn two_pass_filter<'a, T>(items: &'a [T], product_id: &str, key: impl Fn(&T) -> &str) -> Vec<&'a T> {
    let exact: Vec<&T> = items
        .iter()
        .filter(|item| match_rank(product_id, key(item)) == Some(MatchRank::Exact))
        .collect();
    if !exact.is_empty() {
        return exact;
    }
    items
        .iter()
        .filter(|item| match_rank(product_id, key(item)) == Some(MatchRank::Suffix))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use creditline_shared::PackageType;
    use uuid::Uuid;

    fn package(name: &str, product: Option<&str>, package_id: Option<&str>) -> CreditPackage {
        CreditPackage {
            id: Uuid::new_v4(),
            name: name.to_string(),
            credits: 100,
            bonus_percentage: None,
            price_cents: 499,
            provider_product_id: product.map(str::to_string),
            provider_package_id: package_id.map(str::to_string),
            package_type: PackageType::OneTime,
        }
    }

    #[test]
    fn test_candidates_dedupe_and_skip_blank() {
        let mut candidates = AppUserCandidates::new();
        candidates
            .push(" rc_user ")
            .push("")
            .push_opt(None)
            .push("rc_user")
            .push("internal");
        assert_eq!(candidates.to_vec(), vec!["rc_user", "internal"]);
        assert_eq!(candidates.first(), Some("rc_user"));
        assert_eq!(candidates.to_string(), "rc_user, internal");
    }

    #[test]
    fn test_candidates_from_iter_keeps_order() {
        let candidates: AppUserCandidates = ["b", "a", "b", "  "].into_iter().collect();
        assert_eq!(candidates.to_vec(), vec!["b", "a"]);
    }

    #[test]
    fn test_suffix_key() {
        assert_eq!(product_suffix_key("com.example.credits_100"), "credits_100");
        assert_eq!(product_suffix_key("$rc_credits_100"), "credits_100");
        assert_eq!(product_suffix_key("credits_100"), "credits_100");
        assert_eq!(product_suffix_key("com.example."), "");
    }

    #[test]
    fn test_match_rank() {
        assert_eq!(match_rank("a.b.c", "a.b.c"), Some(MatchRank::Exact));
        assert_eq!(
            match_rank("$rc_credits_100", "com.example.credits_100"),
            Some(MatchRank::Suffix)
        );
        assert_eq!(match_rank("com.example.credits_100", "com.example.credits_500"), None);
        assert_eq!(match_rank("", ""), None);
        assert_eq!(match_rank("com.a.", "com.b."), None);
    }

    #[test]
    fn test_find_package_prefers_exact() {
        let packages = vec![
            package("Fuzzy", Some("com.other.credits_100"), None),
            package("Exact", Some("com.example.credits_100"), None),
        ];
        let found = find_package(&packages, &["com.example.credits_100"]).unwrap();
        assert_eq!(found.name, "Exact");
    }

    #[test]
    fn test_find_package_by_package_key() {
        let packages = vec![package("Hundred", Some("com.example.credits_100"), Some("$rc_credits_100"))];
        assert_eq!(find_package(&packages, &["$rc_credits_100"]).unwrap().name, "Hundred");

        let packages = vec![package("Hundred", Some("com.example.credits_100"), None)];
        assert_eq!(find_package(&packages, &["$rc_credits_100"]).unwrap().name, "Hundred");
    }

    #[test]
    fn test_find_package_tries_ids_in_order() {
        let packages = vec![
            package("Five", Some("com.example.credits_500"), None),
            package("Hundred", Some("com.example.credits_100"), None),
        ];
        let found = find_package(&packages, &["com.example.credits_100", "com.example.credits_500"]).unwrap();
        assert_eq!(found.name, "Hundred");
        assert!(find_package(&packages, &["com.example.credits_999"]).is_none());
    }

    #[test]
    fn test_two_pass_filter() {
        let ids = vec!["com.example.credits_100", "$rc_credits_100", "other"];
        let exact = two_pass_filter(&ids, "$rc_credits_100", |s| *s);
        assert_eq!(exact, vec![&"$rc_credits_100"]);

        let fuzzy = two_pass_filter(&ids, "com.store.credits_100", |s| *s);
        assert_eq!(fuzzy, vec![&"com.example.credits_100", &"$rc_credits_100"]);
    }
}
