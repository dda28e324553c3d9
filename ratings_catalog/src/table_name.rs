use std::{fmt::Display, ops::RangeInclusive, str::FromStr};

use thiserror::Error;

/// Length constraints for a [`TableName`], in bytes.
///
/// PostgreSQL truncates identifiers longer than 63 bytes.
const LENGTH_CONSTRAINT: RangeInclusive<usize> = 1..=63;

fn is_allowed_first(c: char) -> bool {
    c.is_ascii_lowercase() || c == '_'
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'
}

/// [`TableName`] validation errors.
#[derive(Debug, Error)]
pub enum TableNameError {
    #[error(
        "table name {:?} length must be between {} and {} bytes",
        name,
        LENGTH_CONSTRAINT.start(),
        LENGTH_CONSTRAINT.end()
    )]
    LengthConstraint { name: String },

    #[error(
        "table name {:?} contains invalid character at position {}; \
        only lowercase ASCII letters, digits and '_' are allowed, \
        and the name may not start with a digit",
        name,
        bad_char_offset
    )]
    BadChars { bad_char_offset: usize, name: String },
}

/// A table name that is safe to splice, unquoted, into SQL text.
///
/// Only lowercase ASCII letters, digits and underscores are accepted, so the
/// name means the same thing quoted or unquoted and can never escape the
/// identifier position it is placed in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Result<Self, TableNameError> {
        let name = name.into();

        if !LENGTH_CONSTRAINT.contains(&name.len()) {
            return Err(TableNameError::LengthConstraint { name });
        }

        let bad_char_offset = name.chars().enumerate().position(|(i, c)| {
            if i == 0 {
                !is_allowed_first(c)
            } else {
                !is_allowed(c)
            }
        });
        if let Some(bad_char_offset) = bad_char_offset {
            return Err(TableNameError::BadChars {
                bad_char_offset,
                name,
            });
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TableName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for TableName {
    type Err = TableNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TableName {
    type Error = TableNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TableName> for String {
    fn from(name: TableName) -> Self {
        name.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_valid_names() {
        for name in ["ratings", "range_part0", "_tmp", "rrobin_part12", "a"] {
            assert_eq!(TableName::new(name).unwrap().as_str(), name);
        }
        assert!(TableName::new("a".repeat(63)).is_ok());
    }

    #[test]
    fn test_length() {
        assert_matches!(
            TableName::new(""),
            Err(TableNameError::LengthConstraint { .. })
        );
        assert_matches!(
            TableName::new("a".repeat(64)),
            Err(TableNameError::LengthConstraint { .. })
        );
    }

    #[test]
    fn test_bad_chars() {
        assert_matches!(
            TableName::new("0ratings"),
            Err(TableNameError::BadChars {
                bad_char_offset: 0,
                ..
            })
        );
        assert_matches!(
            TableName::new("Ratings"),
            Err(TableNameError::BadChars {
                bad_char_offset: 0,
                ..
            })
        );
        assert_matches!(
            TableName::new("ratings; drop table x"),
            Err(TableNameError::BadChars {
                bad_char_offset: 7,
                ..
            })
        );
        assert_matches!(
            TableName::new("rat\"ings"),
            Err(TableNameError::BadChars {
                bad_char_offset: 3,
                ..
            })
        );
    }
}
