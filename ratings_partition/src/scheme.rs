use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

/// How the main table is split into partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScheme {
    /// Partition by rating value.
    Range,
    /// Partition by position in the main table.
    RoundRobin,
}

impl PartitionScheme {
    pub const ALL: [Self; 2] = [Self::Range, Self::RoundRobin];

    pub const RANGE_PREFIX: &'static str = "range_part";
    pub const ROUND_ROBIN_PREFIX: &'static str = "rrobin_part";

    /// Name prefix shared by every partition table of this scheme.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Range => Self::RANGE_PREFIX,
            Self::RoundRobin => Self::ROUND_ROBIN_PREFIX,
        }
    }

    /// Name of the table holding partition `index`, e.g. `range_part3`.
    pub fn table_name(&self, index: u32) -> String {
        format!("{}{index}", self.prefix())
    }

    /// Inverse of [`Self::table_name()`].
    ///
    /// Returns `None` for names that merely share the prefix, such as
    /// `range_part_old` or `range_part01`.
    pub fn index_from_table_name(&self, name: &str) -> Option<u32> {
        let digits = name.strip_prefix(self.prefix())?;
        if digits.is_empty()
            || !digits.bytes().all(|b| b.is_ascii_digit())
            || (digits.len() > 1 && digits.starts_with('0'))
        {
            return None;
        }
        digits.parse().ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Range => "range",
            Self::RoundRobin => "round_robin",
        }
    }
}

impl Display for PartitionScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown partition scheme: {0}")]
pub struct UnknownSchemeError(String);

impl FromStr for PartitionScheme {
    type Err = UnknownSchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "range" => Ok(Self::Range),
            "round_robin" | "round-robin" | "rrobin" => Ok(Self::RoundRobin),
            _ => Err(UnknownSchemeError(s.to_string())),
        }
    }
}
