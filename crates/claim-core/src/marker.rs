//! Claim markers: the small `taken_by.txt` record establishing folder ownership.
//!
//! Two wire formats coexist:
//!
//! ```text
//! Remote (bucket / mount):      Mirror (local workspace copy):
//!   alice                         user3
//!   Claimed at: <timestamp>       alice
//!                                 Claimed at: <timestamp>
//! ```
//!
//! Both parse into the same `ClaimMarker`, so the resolver never branches on
//! where a marker came from.

use crate::folder::FolderId;
use crate::identity::Identity;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use thiserror::Error;

/// File name of the marker inside a folder's namespace.
pub const MARKER_FILE: &str = "taken_by.txt";

const CLAIMED_AT_LABEL: &str = "Claimed at:";

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("Marker is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Which of the two on-disk layouts a marker uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerFormat {
    /// `<identity>\nClaimed at: <ts>` as stored on a backend.
    Remote,
    /// `<folder>\n<identity>\nClaimed at: <ts>` as kept in the local workspace.
    Mirror,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimMarker {
    pub format: MarkerFormat,
    /// Only present in the mirror format.
    pub folder: Option<FolderId>,
    /// `None` when the marker exists but names nobody (e.g. an empty file).
    pub owner: Option<Identity>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl ClaimMarker {
    /// A fresh backend marker for `owner`.
    pub fn remote(owner: &Identity, claimed_at: DateTime<Utc>) -> Self {
        Self {
            format: MarkerFormat::Remote,
            folder: None,
            owner: Some(owner.clone()),
            claimed_at: Some(claimed_at),
        }
    }

    /// A fresh local mirror marker for `owner` holding `folder`.
    pub fn mirror(folder: &FolderId, owner: &Identity, claimed_at: DateTime<Utc>) -> Self {
        Self {
            format: MarkerFormat::Mirror,
            folder: Some(folder.clone()),
            owner: Some(owner.clone()),
            claimed_at: Some(claimed_at),
        }
    }

    /// Whether this marker names `identity` as its owner.
    pub fn is_owned_by(&self, identity: &Identity) -> bool {
        self.owner.as_ref() == Some(identity)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MarkerError> {
        let text = String::from_utf8(bytes.to_vec())?;
        Ok(Self::parse(&text))
    }

    /// Parse either format. Never fails: unrecognizable content yields a
    /// marker with no owner, which still counts as a claim.
    pub fn parse(content: &str) -> Self {
        let lines: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        let claimed_idx = lines.iter().position(|l| l.starts_with(CLAIMED_AT_LABEL));
        let claimed_at = claimed_idx.and_then(|idx| {
            parse_timestamp(lines[idx][CLAIMED_AT_LABEL.len()..].trim())
        });
        let header = &lines[..claimed_idx.unwrap_or(lines.len())];

        let mirror_folder = match header {
            [first, _, ..] => first.parse::<FolderId>().ok(),
            _ => None,
        };

        match mirror_folder {
            Some(folder) => Self {
                format: MarkerFormat::Mirror,
                folder: Some(folder),
                owner: Some(Identity::new(header[1])),
                claimed_at,
            },
            None => Self {
                format: MarkerFormat::Remote,
                folder: None,
                owner: header.first().map(|owner| Identity::new(owner)),
                claimed_at,
            },
        }
    }

    /// Render in this marker's own format.
    pub fn render(&self) -> String {
        let mut lines = Vec::with_capacity(3);
        if let (MarkerFormat::Mirror, Some(folder)) = (self.format, &self.folder) {
            lines.push(folder.to_string());
        }
        if let Some(owner) = &self.owner {
            lines.push(owner.to_string());
        }
        if let Some(ts) = &self.claimed_at {
            lines.push(format!(
                "{} {}",
                CLAIMED_AT_LABEL,
                ts.to_rfc3339_opts(SecondsFormat::Micros, true)
            ));
        }
        lines.join("\n")
    }
}

/// Accepts RFC 3339 and the naive `YYYY-MM-DDTHH:MM:SS[.ffffff]` form older
/// markers were written with (read as UTC).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
