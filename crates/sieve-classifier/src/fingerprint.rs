use sha2::{Digest, Sha256};
use sieve_types::ClassificationLevel;

/// ASCII unit separator placed between hashed components.
pub const FIELD_SEPARATOR: u8 = 0x1f;

/// Stable group key: SHA-256 over the level tag and the ordered field values,
/// rendered as 64 lowercase hex characters.
pub fn fingerprint<S: AsRef<str>>(level: ClassificationLevel, fields: &[S]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(level.as_str().as_bytes());
    for field in fields {
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(field.as_ref().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::fingerprint;
    use proptest::prelude::*;
    use sieve_types::ClassificationLevel;

    #[test]
    fn fingerprint_is_lowercase_hex_of_fixed_width() {
        let value = fingerprint(ClassificationLevel::Unclassified, &["boom"]);
        assert_eq!(value.len(), 64);
        assert!(value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn separator_keeps_field_boundaries_distinct() {
        let joined = fingerprint(ClassificationLevel::LoggerPattern, &["ab", "c"]);
        let shifted = fingerprint(ClassificationLevel::LoggerPattern, &["a", "bc"]);
        assert_ne!(joined, shifted);
    }

    #[test]
    fn level_tag_is_part_of_the_key() {
        let fields = ["NullPointerException"];
        assert_ne!(
            fingerprint(ClassificationLevel::RuleFailure, &fields),
            fingerprint(ClassificationLevel::Unclassified, &fields)
        );
    }

    proptest! {
        #[test]
        fn property_fingerprint_is_stable(fields in proptest::collection::vec(any::<String>(), 0..5)) {
            let first = fingerprint(ClassificationLevel::Custom, &fields);
            let second = fingerprint(ClassificationLevel::Custom, &fields.clone());
            prop_assert_eq!(first, second);
        }
    }
}
