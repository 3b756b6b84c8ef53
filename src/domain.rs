//! Wildcard domain lookup keys
//!
//! A hostname is looked up in the registry under an ordered list of keys,
//! from the exact name down to the global wildcard. The first key whose pool
//! has a real backend wins.

/// Maximum number of labels considered for wildcard expansion.
/// Longer hostnames keep only their rightmost labels.
pub const MAX_LOOKUP_LABELS: usize = 6;

/// The global wildcard key, tried last
pub const GLOBAL_WILDCARD: &str = "*";

/// Compute the specificity-ordered lookup keys for a hostname.
///
/// ```
/// use tenantgate::domain::keys_for;
///
/// assert_eq!(
///     keys_for("a.b.example.com"),
///     vec!["a.b.example.com", "*.b.example.com", "*.example.com", "*.com", "*"]
/// );
/// ```
pub fn keys_for(hostname: &str) -> Vec<String> {
    let mut labels: Vec<&str> = hostname.split('.').collect();
    if labels.len() > MAX_LOOKUP_LABELS {
        labels.drain(..labels.len() - MAX_LOOKUP_LABELS);
    }

    let mut keys = Vec::with_capacity(labels.len() + 1);
    keys.push(labels.join("."));

    for start in 1..labels.len() {
        keys.push(format!("*.{}", labels[start..].join(".")));
    }

    keys.push(GLOBAL_WILDCARD.to_string());
    keys
}
