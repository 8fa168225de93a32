//! Channel identifiers.
//!
//! A channel is the opaque path segment that names one relay endpoint
//! (`POST /{channel}` in, `GET /events/{channel}` out).

use std::fmt;

use uuid::Uuid;

pub const MIN_CHANNEL_LEN: usize = 12;
pub const MAX_CHANNEL_LEN: usize = 64;

/// A validated channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel(String);

impl Channel {
    /// Validates a raw path segment.
    ///
    /// Returns `None` when the length is outside 12..=64 or a character is
    /// not alphanumeric, `-` or `_`.
    pub fn parse(raw: &str) -> Option<Self> {
        if is_valid(raw) {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }

    /// A fresh random channel (32 lowercase hex characters).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn is_valid(raw: &str) -> bool {
    (MIN_CHANNEL_LEN..=MAX_CHANNEL_LEN).contains(&raw.len())
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_bounds() {
        assert!(Channel::parse(&"a".repeat(12)).is_some());
        assert!(Channel::parse(&"a".repeat(64)).is_some());
    }

    #[test]
    fn rejects_out_of_range_lengths() {
        assert!(Channel::parse("").is_none());
        assert!(Channel::parse(&"a".repeat(11)).is_none());
        assert!(Channel::parse(&"a".repeat(65)).is_none());
    }

    #[test]
    fn rejects_path_characters() {
        assert!(Channel::parse("abcdefabcdef/x").is_none());
        assert!(Channel::parse("abcdef.abcdef").is_none());
        assert!(Channel::parse("abcdef abcdef").is_none());
    }

    #[test]
    fn generated_channels_are_valid_and_distinct() {
        let a = Channel::generate();
        let b = Channel::generate();
        assert!(is_valid(a.as_str()));
        assert_eq!(a.as_str().len(), 32);
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn prop_valid_alphabet_in_range_is_accepted(s in "[A-Za-z0-9_-]{12,64}") {
            prop_assert!(Channel::parse(&s).is_some());
        }

        #[test]
        fn prop_short_strings_rejected(s in "[A-Za-z0-9]{0,11}") {
            prop_assert!(Channel::parse(&s).is_none());
        }

        #[test]
        fn prop_long_strings_rejected(s in "[A-Za-z0-9]{65,128}") {
            prop_assert!(Channel::parse(&s).is_none());
        }
    }
}
