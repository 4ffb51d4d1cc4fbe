//! Affiliation string normalization and fuzzy similarity.
//!
//! All matching in the knowledge base and the fuzzy rung happens on
//! normalization keys produced by [`normalize_key`], so "Univ. of Toronto"
//! and "university of toronto" collapse to the same key.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Normalize an organization string into a comparison key.
///
/// Steps (order matters):
/// 1. Unicode NFKD normalization, dropping combining marks ("é" → "e")
/// 2. Lowercase
/// 3. Punctuation → space
/// 4. Collapse runs of whitespace, trim
pub fn normalize_key(s: &str) -> String {
    let decomposed: String = s.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    let lowered = decomposed.to_lowercase();

    static PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s]").unwrap());
    let stripped = PUNCT.replace_all(&lowered, " ");

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Token-order-insensitive similarity in [0, 1].
///
/// Both sides are keyed with [`normalize_key`], their tokens sorted, and the
/// rejoined strings compared, so "Toronto, University of" still scores 1.0
/// against "University of Toronto".
pub fn token_sort_similarity(a: &str, b: &str) -> f64 {
    let ka = sorted_key(a);
    let kb = sorted_key(b);
    if ka.is_empty() || kb.is_empty() {
        return 0.0;
    }
    rapidfuzz::fuzz::ratio(ka.chars(), kb.chars())
}

fn sorted_key(s: &str) -> String {
    let key = normalize_key(s);
    let mut tokens: Vec<&str> = key.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Cheap cleanup of a raw affiliation before it is displayed or carried
/// through unmatched: trims and collapses internal whitespace without
/// touching case or punctuation.
pub fn clean_display(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_lowercases_and_strips_punctuation() {
        assert_eq!(normalize_key("Univ. of Toronto"), "univ of toronto");
    }

    #[test]
    fn key_drops_diacritics() {
        assert_eq!(
            normalize_key("École Polytechnique Fédérale"),
            "ecole polytechnique federale"
        );
    }

    #[test]
    fn key_collapses_whitespace() {
        assert_eq!(normalize_key("  MIT \t CSAIL \n Lab "), "mit csail lab");
    }

    #[test]
    fn key_keeps_non_latin_letters() {
        assert_eq!(normalize_key("清华大学"), "清华大学");
    }

    #[test]
    fn key_empty_input() {
        assert_eq!(normalize_key("  ...  "), "");
    }

    #[test]
    fn identical_strings_score_one() {
        assert_eq!(
            token_sort_similarity("University of Toronto", "University of Toronto"),
            1.0
        );
    }

    #[test]
    fn token_order_is_ignored() {
        assert_eq!(
            token_sort_similarity("Toronto, University of", "University of Toronto"),
            1.0
        );
    }

    #[test]
    fn near_miss_scores_high_but_below_one() {
        let score = token_sort_similarity("Tsinghua Univ", "Tsinghua University");
        assert!(score > 0.7 && score < 1.0, "score = {score}");
    }

    #[test]
    fn unrelated_strings_score_low() {
        let score = token_sort_similarity("Google DeepMind", "Stanford University");
        assert!(score < 0.5, "score = {score}");
    }

    #[test]
    fn empty_side_scores_zero() {
        assert_eq!(token_sort_similarity("", "MIT"), 0.0);
        assert_eq!(token_sort_similarity("MIT", "   "), 0.0);
    }

    #[test]
    fn clean_display_preserves_case() {
        assert_eq!(
            clean_display("  Dept. of CS,\n  MIT  "),
            "Dept. of CS, MIT"
        );
    }
}
