//! URL-safe slugs for display names.

use crate::store::{DurableStore, Query, StoreResult};

/// Field every slugged entity stores its slug under.
pub const SLUG_FIELD: &str = "slug";

/// Lowercase, trim, and map separators (space, `_`, `-`) to `-`, dropping every
/// other non-alphanumeric character.
///
/// Applying it twice yields the same result as applying it once.
pub fn generate_slug(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            ' ' | '_' | '-' => Some('-'),
            c if c.is_alphanumeric() => Some(c),
            _ => None,
        })
        .collect()
}

/// Slug for `s` that no stored entity of `kind` uses yet.
///
/// Returns the plain slug when free, otherwise `slug-2`, `slug-3`, ... until an
/// unused one is found. A name with no usable characters falls back to the
/// lowercased kind.
pub async fn generate_unique_slug(
    store: &dyn DurableStore,
    kind: &str,
    s: &str,
) -> StoreResult<String> {
    let mut base = generate_slug(s);
    if base.is_empty() {
        base = generate_slug(kind);
    }

    if !slug_taken(store, kind, &base).await? {
        return Ok(base);
    }

    let mut counter = 2u64;
    loop {
        let candidate = format!("{}-{}", base, counter);
        if !slug_taken(store, kind, &candidate).await? {
            return Ok(candidate);
        }
        counter += 1;
    }
}

async fn slug_taken(store: &dyn DurableStore, kind: &str, slug: &str) -> StoreResult<bool> {
    let query = Query::kind(kind).filter(SLUG_FIELD, slug).limit(1);
    let count = store.count(&query).await.map_err(|e| {
        tracing::error!(kind, slug, error = %e, "generate_unique_slug: slug lookup failed");
        e
    })?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_slug_basic() {
        assert_eq!(generate_slug("My awesome string"), "my-awesome-string");
    }

    #[test]
    fn test_generate_slug_normalizes_separators() {
        assert_eq!(generate_slug("  snake_case and-kebab  "), "snake-case-and-kebab");
    }

    #[test]
    fn test_generate_slug_strips_punctuation() {
        assert_eq!(generate_slug("Acme, Inc. (EU)!"), "acme-inc-eu");
        assert_eq!(generate_slug("!!!"), "");
    }

    #[test]
    fn test_generate_slug_keeps_unicode_letters_and_digits() {
        assert_eq!(generate_slug("Café 42"), "café-42");
    }

    #[test]
    fn test_generate_slug_is_idempotent() {
        let inputs = [
            "My awesome string",
            "  Leading and trailing  ",
            "tabs\tand\nnewlines",
            "UPPER_lower-Mixed 123",
            "İstanbul Şirketi",
            "---",
            "a  b",
            "",
        ];
        for input in inputs {
            let once = generate_slug(input);
            assert_eq!(generate_slug(&once), once, "input: {:?}", input);
            assert_eq!(once, once.to_lowercase());
            assert_eq!(once, once.trim());
        }
    }
}
