//! Model mask matching.
//!
//! A mask decides which instrument models a script applies to:
//!
//! - `""` matches every model.
//! - `%` matches any single character.
//! - `*` ends the comparison: only the characters before it are checked.
//! - Without `*`, mask and model must have the same length.
//!
//! Comparison is ordinal and case-sensitive, so `"260%*"` matches `"2601A"` and
//! `"2602A"` but not `"2701A"`, while `"26%0*"` matches none of them.

/// Matches any single model character.
pub const IGNORE_CHAR: char = '%';

/// Ends the compared prefix.
pub const WILDCARD_CHAR: char = '*';

/// Returns true when `model` satisfies `mask`.
pub fn matches(model: &str, mask: &str) -> bool {
    if mask.is_empty() {
        return true;
    }
    if model.is_empty() {
        return false;
    }

    let model: Vec<char> = model.chars().collect();
    let mask: Vec<char> = mask.chars().collect();

    let compared = match mask.iter().position(|&c| c == WILDCARD_CHAR) {
        Some(prefix_len) => {
            if model.len() < prefix_len {
                return false;
            }
            &mask[..prefix_len]
        }
        None => {
            if model.len() != mask.len() {
                return false;
            }
            &mask[..]
        }
    };

    compared
        .iter()
        .zip(model.iter())
        .all(|(&m, &c)| m == IGNORE_CHAR || m == c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_mask_matches_all() {
        assert!(matches("2602A", ""));
        assert!(matches("", ""));
    }

    #[test]
    fn test_empty_model_never_matches() {
        assert!(!matches("", "2602A"));
        assert!(!matches("", "*"));
    }

    #[test]
    fn test_wildcard_family_mask() {
        assert!(matches("2601A", "260%*"));
        assert!(matches("2602A", "260%*"));
        assert!(!matches("2701A", "260%*"));
        assert!(matches("2640B", "26%0*"));
        assert!(!matches("2602A", "26%0*"));
    }

    #[test]
    fn test_wildcard_prefix_longer_than_model() {
        assert!(!matches("26", "2602*"));
    }

    #[test]
    fn test_exact_mask_requires_equal_length() {
        assert!(matches("2602A", "2602A"));
        assert!(!matches("2602", "2602A"));
        assert!(!matches("2602AB", "2602A"));
    }

    #[test]
    fn test_ignore_char_without_wildcard() {
        assert!(matches("2612B", "26%2%"));
        assert!(!matches("2612B", "26%3%"));
    }

    #[test]
    fn test_case_sensitive() {
        assert!(!matches("2602a", "2602A"));
    }

    #[test]
    fn test_bare_wildcard_matches_any_non_empty_model() {
        assert!(matches("7510", "*"));
    }
}
