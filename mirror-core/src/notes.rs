//! The portable review-note format.
//!
//! Reviews are stored as free-form blobs attached to commits under three
//! notes refs: review requests, discussion comments, and CI reports. Each
//! note is the JSON serialization of one record, one record per line when
//! multiple notes accumulate on the same commit. The serialization is
//! reversible: anything we write can be parsed back and compared.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Notes ref holding review requests, keyed by the first commit of the review.
pub const REQUESTS_REF: &str = "refs/notes/devtools/reviews";
/// Notes ref holding discussion comments.
pub const COMMENTS_REF: &str = "refs/notes/devtools/discuss";
/// Notes ref holding CI reports, keyed by the commit the CI ran against.
pub const REPORTS_REF: &str = "refs/notes/devtools/ci";

/// Render a unix timestamp in the fixed-width form used throughout the
/// notes format: seconds since the epoch, right-justified in ten columns.
///
/// Comparisons between records are always over this textual form, never
/// over clock values.
pub fn convert_time(seconds: i64) -> String {
    format!("{:>10}", seconds)
}

/// Outcome reported by a CI agent. A pending run carries no status at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Failure,
}

/// A single continuous-integration report attached to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Report {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReportStatus>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent: String,
}

/// A request for review of a ref against a target branch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub review_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub requester: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reviewers: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_commit: String,
}

/// Where in the reviewed snapshot a comment is anchored.
///
/// A review-level comment sets only the commit; a file-level comment adds a
/// path; a line-level comment adds a range as well.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Range {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub start_line: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// A single discussion comment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Comment {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    /// Content hash of the comment this one replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Comment {
    /// Serialize the comment to its note form.
    pub fn write(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Content address of the comment: SHA-1 over its note form, as hex.
    pub fn hash(&self) -> Result<String, serde_json::Error> {
        let bytes = self.write()?;
        let mut hasher = Sha1::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

impl Request {
    pub fn write(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A comment together with its content hash, forming one thread entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentThread {
    pub hash: String,
    pub comment: Comment,
}

/// Everything mirrored for one pull request: the revision the review is
/// anchored to, the request itself, and the comment threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub revision: String,
    pub request: Request,
    pub comments: Vec<CommentThread>,
}

/// Parse every well-formed record out of a raw notes blob, one JSON record
/// per line. Lines that fail to parse are skipped: foreign notes under the
/// same ref must not poison a mirror pass.
pub fn parse_all_valid<T: DeserializeOwned>(raw: &[u8]) -> Vec<T> {
    raw.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_slice(line).ok())
        .collect()
}
