//! FolderId: the `user<N>` token naming a per-session workspace slot.
//!
//! Ordering is by the numeric suffix, so `user2` sorts before `user10`.

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Case-sensitive prefix shared by every folder identifier.
pub const FOLDER_PREFIX: &str = "user";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FolderIdError {
    #[error("Folder id must start with 'user': {0}")]
    MissingPrefix(String),

    #[error("Folder id suffix must be a positive base-10 integer: {0}")]
    InvalidNumber(String),
}

/// Identifier of a claimable folder (`user1`, `user2`, ...).
///
/// The original spelling is kept for display so keys like `user007` round-trip
/// to the same object path, while comparisons use the numeric value.
#[derive(Debug, Clone)]
pub struct FolderId {
    number: u64,
    raw: String,
}

impl FolderId {
    /// Build the canonical id for a number.
    pub fn from_number(number: u64) -> Result<Self, FolderIdError> {
        if number == 0 {
            return Err(FolderIdError::InvalidNumber(format!("{FOLDER_PREFIX}0")));
        }
        Ok(Self {
            number,
            raw: format!("{FOLDER_PREFIX}{number}"),
        })
    }

    /// Numeric suffix.
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for FolderId {
    type Err = FolderIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix(FOLDER_PREFIX)
            .ok_or_else(|| FolderIdError::MissingPrefix(s.to_string()))?;

        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(FolderIdError::InvalidNumber(s.to_string()));
        }

        let number: u64 = digits
            .parse()
            .map_err(|_| FolderIdError::InvalidNumber(s.to_string()))?;
        if number == 0 {
            return Err(FolderIdError::InvalidNumber(s.to_string()));
        }

        Ok(Self {
            number,
            raw: s.to_string(),
        })
    }
}

impl Display for FolderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for FolderId {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FolderId {}

impl PartialOrd for FolderId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FolderId {
    fn cmp(&self, other: &Self) -> Ordering {
        // Tie-break on spelling keeps `user7` and `user007` distinct
        self.number
            .cmp(&other.number)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl std::hash::Hash for FolderId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.number.hash(state);
        self.raw.hash(state);
    }
}

/// Keep the names that follow the `user<N>` convention, sorted ascending by N.
///
/// Names that do not match are dropped silently. An empty result means no
/// folders are configured, which callers must distinguish from "all claimed".
pub fn collect_folder_ids<I, S>(names: I) -> Vec<FolderId>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut ids: Vec<FolderId> = names
        .into_iter()
        .filter_map(|name| name.as_ref().parse().ok())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}
