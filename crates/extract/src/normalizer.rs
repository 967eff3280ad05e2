use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.,!?;:'\x22()\[\]]").expect("valid punctuation regex"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));
static LEADING_ARTICLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(the|a|an) ").expect("valid article regex"));

/// Canonicalises entity names within one document so that "the NHS", "NHS" and
/// "N.H.S." become one entity.
pub struct EntityNormalizer {
    /// Maps normalized name -> canonical name. Ordered so fuzzy matches are stable.
    aliases: BTreeMap<String, String>,
}

impl EntityNormalizer {
    pub fn new() -> Self {
        Self {
            aliases: BTreeMap::new(),
        }
    }

    /// Lowercase, strip punctuation and leading articles, collapse whitespace
    pub fn clean(name: &str) -> String {
        let lowered = name.trim().to_lowercase();
        let stripped = PUNCTUATION.replace_all(&lowered, "");
        let collapsed = WHITESPACE.replace_all(stripped.trim(), " ");
        LEADING_ARTICLE.replace(&collapsed, "").to_string()
    }

    /// Id-safe slug of a normalized name: "city council" -> "city_council"
    pub fn slug(normalized: &str) -> String {
        normalized
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect()
    }

    /// Resolve a surface name to its canonical form, registering it if new
    pub fn normalize(&mut self, name: &str) -> String {
        let normalized = Self::clean(name);

        if let Some(canonical) = self.aliases.get(&normalized) {
            return canonical.clone();
        }

        let found_canonical = self
            .aliases
            .iter()
            .find(|(existing, _)| Self::are_similar(&normalized, existing))
            .map(|(_, canonical)| canonical.clone());

        if let Some(canonical) = found_canonical {
            self.aliases.insert(normalized, canonical.clone());
            return canonical;
        }

        // This is a new entity - use the normalized form as canonical
        self.aliases.insert(normalized.clone(), normalized.clone());
        normalized
    }

    fn are_similar(a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }

        let words_a: Vec<&str> = a.split_whitespace().collect();
        let words_b: Vec<&str> = b.split_whitespace().collect();
        if words_a.is_empty() || words_b.is_empty() {
            return false;
        }

        // Dotted acronyms collapse to the same letters ("n h s" vs "nhs")
        if words_a.concat() == words_b.concat() {
            return true;
        }

        // Multi-word names sharing most of their words
        if words_a.len() > 1 && words_b.len() > 1 {
            let common = words_a.iter().filter(|w| words_b.contains(w)).count();
            let total = words_a.len().max(words_b.len());
            return common as f64 / total as f64 > 0.7;
        }

        false
    }
}

impl Default for EntityNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        let mut normalizer = EntityNormalizer::new();

        assert_eq!(normalizer.normalize("City Council"), "city council");
        assert_eq!(normalizer.normalize("City Council!"), "city council");
        assert_eq!(normalizer.normalize("  the City  Council  "), "city council");
    }

    #[test]
    fn test_alias_resolution() {
        let mut normalizer = EntityNormalizer::new();

        let n1 = normalizer.normalize("NHS");
        let n2 = normalizer.normalize("N.H.S.");
        assert_eq!(n1, n2);

        let n3 = normalizer.normalize("Riverside Community Health Centre");
        let n4 = normalizer.normalize("Riverside Community Health Center Centre");
        assert_eq!(n3, n4);
    }

    #[test]
    fn test_short_names_do_not_collapse_by_substring() {
        let mut normalizer = EntityNormalizer::new();

        let ai = normalizer.normalize("AI");
        let maid = normalizer.normalize("Maid");
        assert_ne!(ai, maid);
        assert_eq!(normalizer.normalize("A.I."), "ai");
        assert_eq!(EntityNormalizer::slug("city council"), "city_council");
    }

    #[test]
    fn test_fuzzy_match_is_independent_of_registration_order() {
        let names = ["North East Health Trust", "Northeast Healthtrust Board"];
        for order in [[0, 1], [1, 0]] {
            let mut normalizer = EntityNormalizer::new();
            for i in order {
                normalizer.normalize(names[i]);
            }
            // Similar to both registered names
            assert_eq!(
                normalizer.normalize("North East Health Trust Board"),
                "north east health trust"
            );
        }
    }
}
