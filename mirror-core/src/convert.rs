//! Conversions from GitHub records into the review-note format.
//!
//! Every function here is pure and deterministic: the same payload always
//! produces the same note, so a repeated mirror pass produces byte-identical
//! material and the reconciler can deduplicate by comparison.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::github::{IssueComment, PullRequest, PullRequestComment, RepoStatus};
use crate::notes::{
    convert_time as render_time, Comment, CommentThread, Location, Range, Report, ReportStatus,
    Request, Review,
};
use crate::repository::Repository;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    #[error("status contained no timestamp")]
    NoTimestamp,
    #[error("status state was not \"success\", \"failure\", \"error\", \"pending\", or null")]
    InvalidState,
    #[error("insufficient data for meaningful conversion")]
    InsufficientInfo,
    #[error("malformed diff hunk: {0:?}")]
    MalformedHunk(String),
}

/// Render an instant in the textual timestamp form used by the notes format.
pub fn convert_time(t: DateTime<Utc>) -> String {
    render_time(t.timestamp())
}

fn pick_timestamp(
    updated_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
) -> Option<String> {
    updated_at.or(created_at).map(convert_time)
}

/// Convert a commit status into a CI report.
pub fn convert_status(status: &RepoStatus) -> Result<Report, ConvertError> {
    let timestamp =
        pick_timestamp(status.updated_at, status.created_at).ok_or(ConvertError::NoTimestamp)?;

    let report_status = match status.state.as_deref() {
        Some("success") => Some(ReportStatus::Success),
        Some("failure") | Some("error") => Some(ReportStatus::Failure),
        Some("pending") | None => None,
        Some(_) => return Err(ConvertError::InvalidState),
    };

    Ok(Report {
        timestamp,
        status: report_status,
        url: status.target_url.clone().unwrap_or_default(),
        agent: status.context.clone().unwrap_or_default(),
    })
}

/// Convert a pull request into a review request.
///
/// The target ref is always fully qualified: a bare branch name from the
/// API gains the `refs/heads/` prefix.
pub fn convert_pull_request(pr: &PullRequest) -> Result<Request, ConvertError> {
    let number = pr.number.ok_or(ConvertError::InsufficientInfo)?;
    let requester = pr
        .user
        .as_ref()
        .and_then(|u| u.login.clone())
        .ok_or(ConvertError::InsufficientInfo)?;
    let base = pr.base.as_ref().ok_or(ConvertError::InsufficientInfo)?;
    let base_ref = base
        .ref_name
        .clone()
        .ok_or(ConvertError::InsufficientInfo)?;
    let base_commit = base.sha.clone().ok_or(ConvertError::InsufficientInfo)?;
    let timestamp =
        pick_timestamp(pr.updated_at, pr.created_at).ok_or(ConvertError::InsufficientInfo)?;

    let target_ref = if base_ref.starts_with("refs/heads") {
        base_ref
    } else {
        format!("refs/heads/{}", base_ref)
    };

    let mut description = pr.title.clone().unwrap_or_default();
    if let Some(body) = pr.body.as_deref() {
        if !body.is_empty() {
            description.push_str("\n\n");
            description.push_str(body);
        }
    }

    Ok(Request {
        timestamp,
        review_ref: format!("refs/pull/{}/head", number),
        target_ref,
        requester,
        reviewers: Vec::new(),
        description,
        base_commit,
    })
}

/// Convert a comment on the issue half of a pull request.
///
/// Issue comments carry no location at all; the merge layer treats them as
/// review-level comments when deciding equivalence.
pub fn convert_issue_comment(issue_comment: &IssueComment) -> Result<Comment, ConvertError> {
    let author = issue_comment
        .user
        .as_ref()
        .and_then(|u| u.login.clone())
        .ok_or(ConvertError::InsufficientInfo)?;
    let description = issue_comment
        .body
        .clone()
        .ok_or(ConvertError::InsufficientInfo)?;
    let timestamp = pick_timestamp(issue_comment.updated_at, issue_comment.created_at)
        .ok_or(ConvertError::InsufficientInfo)?;

    Ok(Comment {
        timestamp,
        author,
        parent: None,
        location: None,
        description,
    })
}

/// Convert a comment anchored in the diff of a pull request.
///
/// The location commit is the commit the comment was originally written
/// against. When the payload includes both a path and a diff hunk, the
/// post-image line number is reconstructed from the hunk.
pub fn convert_diff_comment(diff_comment: &PullRequestComment) -> Result<Comment, ConvertError> {
    let author = diff_comment
        .user
        .as_ref()
        .and_then(|u| u.login.clone())
        .ok_or(ConvertError::InsufficientInfo)?;
    let description = diff_comment
        .body
        .clone()
        .ok_or(ConvertError::InsufficientInfo)?;
    let commit = diff_comment
        .original_commit_id
        .clone()
        .ok_or(ConvertError::InsufficientInfo)?;
    let timestamp = pick_timestamp(diff_comment.updated_at, diff_comment.created_at)
        .ok_or(ConvertError::InsufficientInfo)?;

    let mut location = Location {
        commit,
        path: String::new(),
        range: None,
    };
    if let Some(path) = diff_comment.path.clone() {
        location.path = path;
        if let Some(hunk) = diff_comment.diff_hunk.as_deref() {
            location.range = Some(Range {
                start_line: comment_start_line(hunk)?,
            });
        }
    }

    Ok(Comment {
        timestamp,
        author,
        parent: None,
        location: Some(location),
        description,
    })
}

/// Parse the right-hand-side start line out of a unified hunk header of the
/// form `@@ -L[,K] +RL[,RK] @@ ...`.
fn parse_hunk_header(header: &str) -> Option<u32> {
    let rest = header.strip_prefix("@@ -")?;
    let (lhs, rest) = rest.split_once(" +")?;
    if !is_line_spec(lhs) {
        return None;
    }
    let (rhs, _) = rest.split_once(" @@")?;
    if !is_line_spec(rhs) {
        return None;
    }
    let start = rhs.split(',').next()?;
    start.parse().ok()
}

fn is_line_spec(spec: &str) -> bool {
    let mut parts = spec.splitn(2, ',');
    let start = parts.next().unwrap_or("");
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(start) {
        return false;
    }
    match parts.next() {
        Some(count) => all_digits(count),
        None => true,
    }
}

/// Compute the line a diff comment refers to.
///
/// The hunk attached to a comment payload is truncated to the portion that
/// precedes the comment, so the comment sits on the last line of the hunk.
/// Its post-image line number is the hunk's right-hand-side start line plus
/// one for every subsequent line that is not a deletion.
pub fn comment_start_line(hunk: &str) -> Result<u32, ConvertError> {
    let mut lines = hunk.split('\n');
    let header = lines
        .next()
        .ok_or_else(|| ConvertError::MalformedHunk(hunk.to_string()))?;
    let rest: Vec<&str> = lines.collect();
    if rest.is_empty() {
        return Err(ConvertError::MalformedHunk(hunk.to_string()));
    }

    let mut line_number =
        parse_hunk_header(header).ok_or_else(|| ConvertError::MalformedHunk(header.to_string()))?;
    for line in rest {
        if !line.starts_with('-') {
            line_number += 1;
        }
    }
    Ok(line_number)
}

/// The commit a review is anchored to: the first commit the pull request
/// introduced on top of its base, or the head commit if the local clone
/// cannot see any.
async fn review_starting_commit(
    pr: &PullRequest,
    repo: &dyn Repository,
) -> anyhow::Result<String> {
    let base_sha = pr
        .base
        .as_ref()
        .and_then(|b| b.sha.as_deref())
        .ok_or(ConvertError::InsufficientInfo)?;
    let head_sha = pr
        .head
        .as_ref()
        .and_then(|h| h.sha.as_deref())
        .ok_or(ConvertError::InsufficientInfo)?;

    let commits = repo.list_commits_between(base_sha, head_sha).await?;
    match commits.into_iter().next() {
        Some(first) => Ok(first),
        None => Ok(head_sha.to_string()),
    }
}

/// Assemble a full review from a pull request and its two comment streams.
///
/// GitHub spreads a pull request's data across the request object, the
/// issue comments and the diff comments; all three are needed here. The
/// local clone is consulted once, to anchor the review to its starting
/// commit.
pub async fn pull_request_to_review(
    pr: &PullRequest,
    issue_comments: &[IssueComment],
    diff_comments: &[PullRequestComment],
    repo: &dyn Repository,
) -> anyhow::Result<Review> {
    let request = convert_pull_request(pr)?;
    let revision = review_starting_commit(pr, repo).await?;

    let mut comments = Vec::with_capacity(issue_comments.len() + diff_comments.len());
    for issue_comment in issue_comments {
        let comment = convert_issue_comment(issue_comment)?;
        comments.push(CommentThread {
            hash: comment.hash()?,
            comment,
        });
    }
    for diff_comment in diff_comments {
        let comment = convert_diff_comment(diff_comment)?;
        comments.push(CommentThread {
            hash: comment.hash()?,
            comment,
        });
    }

    Ok(Review {
        revision,
        request,
        comments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::User;
    use crate::repository::tests::FakeRepo;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn instant(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn test_pull_request(number: u64) -> PullRequest {
        PullRequest {
            number: Some(number),
            title: Some("Bug fixes.".to_string()),
            body: Some("Fix some bugs.".to_string()),
            user: Some(User::with_login("helpful_contributor")),
            base: Some(crate::github::PullRequestBranch {
                ref_name: Some("dev".to_string()),
                sha: Some("ABCDEFG".to_string()),
            }),
            head: Some(crate::github::PullRequestBranch {
                ref_name: Some("feature".to_string()),
                sha: Some("HIJKLMN".to_string()),
            }),
            created_at: Some(instant(1400000000)),
            updated_at: None,
        }
    }

    #[test]
    fn convert_status_success() {
        let created = instant(1234567890);
        let status = RepoStatus {
            state: Some("success".to_string()),
            target_url: Some("https://ci.example.com/build".to_string()),
            context: Some("ci/example".to_string()),
            created_at: Some(created),
            updated_at: None,
        };
        let report = convert_status(&status).unwrap();
        assert_eq!(report.status, Some(ReportStatus::Success));
        assert_eq!(report.url, "https://ci.example.com/build");
        assert_eq!(report.agent, "ci/example");
        assert_eq!(report.timestamp, convert_time(created));
    }

    #[test]
    fn convert_status_prefers_updated_at() {
        let status = RepoStatus {
            state: Some("pending".to_string()),
            created_at: Some(instant(100)),
            updated_at: Some(instant(200)),
            ..Default::default()
        };
        let report = convert_status(&status).unwrap();
        assert_eq!(report.timestamp, convert_time(instant(200)));
        assert_eq!(report.status, None);
    }

    #[test]
    fn convert_status_without_timestamp_fails() {
        let status = RepoStatus {
            state: Some("success".to_string()),
            ..Default::default()
        };
        assert_eq!(convert_status(&status), Err(ConvertError::NoTimestamp));
    }

    #[test]
    fn convert_status_rejects_unknown_state() {
        let status = RepoStatus {
            state: Some("confused".to_string()),
            created_at: Some(instant(1)),
            ..Default::default()
        };
        assert_eq!(convert_status(&status), Err(ConvertError::InvalidState));
    }

    #[test]
    fn convert_pull_request_basic() {
        let pr = test_pull_request(4);
        let request = convert_pull_request(&pr).unwrap();
        assert_eq!(request.review_ref, "refs/pull/4/head");
        assert_eq!(request.target_ref, "refs/heads/dev");
        assert_eq!(request.requester, "helpful_contributor");
        assert!(request.description.contains("Bug fixes."));
        assert!(request.description.contains("Fix some bugs."));
        assert_eq!(request.base_commit, "ABCDEFG");
        assert_eq!(request.timestamp, convert_time(instant(1400000000)));
    }

    #[test]
    fn convert_pull_request_keeps_qualified_target_ref() {
        let mut pr = test_pull_request(4);
        pr.base.as_mut().unwrap().ref_name = Some("refs/heads/dev".to_string());
        let request = convert_pull_request(&pr).unwrap();
        assert_eq!(request.target_ref, "refs/heads/dev");
    }

    #[test]
    fn convert_pull_request_without_user_fails() {
        let mut pr = test_pull_request(4);
        pr.user = None;
        assert_eq!(
            convert_pull_request(&pr),
            Err(ConvertError::InsufficientInfo)
        );
    }

    #[test]
    fn convert_issue_comment_has_no_location() {
        let comment = IssueComment {
            body: Some("Please sign our CLA".to_string()),
            user: Some(User::with_login("example_org")),
            created_at: Some(instant(500)),
            updated_at: None,
        };
        let converted = convert_issue_comment(&comment).unwrap();
        assert_eq!(converted.author, "example_org");
        assert_eq!(converted.description, "Please sign our CLA");
        assert!(converted.location.is_none());
    }

    #[test]
    fn convert_issue_comment_prefers_updated_at() {
        let comment = IssueComment {
            body: Some("Done".to_string()),
            user: Some(User::with_login("x")),
            created_at: Some(instant(100)),
            updated_at: Some(instant(300)),
        };
        let converted = convert_issue_comment(&comment).unwrap();
        assert_eq!(converted.timestamp, convert_time(instant(300)));
    }

    const TEST_HUNK: &str = "@@ -4,6 +10,10 @@ func changedMethod() {\n \t// This is an existing line\n \t// This is another existing line\n-\t//This is a removed line\n+\t//This is a new line\n+\t//This is a second new line";

    #[test]
    fn convert_diff_comment_computes_line() {
        let comment = PullRequestComment {
            body: Some("Comment on line 14".to_string()),
            user: Some(User::with_login("example_org")),
            path: Some("example.go".to_string()),
            original_commit_id: Some("HIJKLMN".to_string()),
            diff_hunk: Some(TEST_HUNK.to_string()),
            created_at: Some(instant(900)),
            updated_at: None,
        };
        let converted = convert_diff_comment(&comment).unwrap();
        let location = converted.location.unwrap();
        assert_eq!(location.commit, "HIJKLMN");
        assert_eq!(location.path, "example.go");
        assert_eq!(location.range.unwrap().start_line, 14);
    }

    #[test]
    fn convert_diff_comment_requires_original_commit() {
        let comment = PullRequestComment {
            body: Some("x".to_string()),
            user: Some(User::with_login("u")),
            created_at: Some(instant(1)),
            ..Default::default()
        };
        assert_eq!(
            convert_diff_comment(&comment),
            Err(ConvertError::InsufficientInfo)
        );
    }

    #[test]
    fn comment_start_line_counts_non_deletions() {
        assert_eq!(comment_start_line(TEST_HUNK).unwrap(), 14);
    }

    #[test]
    fn comment_start_line_without_range_counts() {
        // Header without the ,count parts on either side.
        let hunk = "@@ -4 +10 @@\n context\n+added";
        assert_eq!(comment_start_line(hunk).unwrap(), 12);
    }

    #[test]
    fn comment_start_line_rejects_short_hunk() {
        assert!(matches!(
            comment_start_line("@@ -1,2 +3,4 @@"),
            Err(ConvertError::MalformedHunk(_))
        ));
    }

    #[test]
    fn comment_start_line_rejects_malformed_header() {
        assert!(matches!(
            comment_start_line("@@ wat @@\n context"),
            Err(ConvertError::MalformedHunk(_))
        ));
        assert!(matches!(
            comment_start_line("@@ -x,2 +3,4 @@\n context"),
            Err(ConvertError::MalformedHunk(_))
        ));
    }

    #[tokio::test]
    async fn pull_request_to_review_anchors_to_first_commit() {
        let repo = FakeRepo::with_commits(vec!["C1".to_string(), "C2".to_string()]);
        let pr = test_pull_request(4);

        let issue_comments = vec![IssueComment {
            body: Some("Please sign our CLA".to_string()),
            user: Some(User::with_login("example_org")),
            created_at: Some(instant(500)),
            updated_at: None,
        }];
        let diff_comments = vec![PullRequestComment {
            body: Some("Comment on line 14".to_string()),
            user: Some(User::with_login("example_org")),
            path: Some("example.go".to_string()),
            original_commit_id: Some("HIJKLMN".to_string()),
            diff_hunk: Some(TEST_HUNK.to_string()),
            created_at: Some(instant(900)),
            updated_at: None,
        }];

        let review = pull_request_to_review(&pr, &issue_comments, &diff_comments, &repo)
            .await
            .unwrap();
        assert_eq!(review.revision, "C1");
        assert_eq!(review.comments.len(), 2);
        assert!(review
            .comments
            .iter()
            .all(|thread| thread.hash == thread.comment.hash().unwrap()));
        assert!(review.comments.iter().any(|thread| {
            thread.comment.description == "Comment on line 14"
                && thread
                    .comment
                    .location
                    .as_ref()
                    .and_then(|l| l.range.as_ref())
                    .map(|r| r.start_line)
                    == Some(14)
        }));
    }

    #[tokio::test]
    async fn pull_request_to_review_falls_back_to_head() {
        let repo = FakeRepo::with_commits(Vec::new());
        let pr = test_pull_request(4);
        let review = pull_request_to_review(&pr, &[], &[], &repo).await.unwrap();
        assert_eq!(review.revision, "HIJKLMN");
    }

    proptest! {
        /// Any well-formed status converts with the expected enum and the
        /// textual form of its creation time.
        #[test]
        fn status_conversion_round_trip(
            state in prop_oneof![
                Just(Some("success".to_string())),
                Just(Some("failure".to_string())),
                Just(Some("error".to_string())),
                Just(Some("pending".to_string())),
                Just(None),
            ],
            seconds in 0i64..4_000_000_000,
        ) {
            let status = RepoStatus {
                state: state.clone(),
                created_at: Some(instant(seconds)),
                ..Default::default()
            };
            let report = convert_status(&status).unwrap();
            prop_assert_eq!(report.timestamp, convert_time(instant(seconds)));
            let expected = match state.as_deref() {
                Some("success") => Some(ReportStatus::Success),
                Some("failure") | Some("error") => Some(ReportStatus::Failure),
                _ => None,
            };
            prop_assert_eq!(report.status, expected);
        }

        /// The converted target ref always begins with refs/heads/ exactly once.
        #[test]
        fn target_ref_is_normalized_once(branch in "[a-zA-Z0-9_/.-]{1,40}") {
            prop_assume!(!branch.starts_with("refs/heads"));
            for base_ref in [branch.clone(), format!("refs/heads/{}", branch)] {
                let mut pr = test_pull_request(1);
                pr.base.as_mut().unwrap().ref_name = Some(base_ref);
                let request = convert_pull_request(&pr).unwrap();
                prop_assert!(request.target_ref.starts_with("refs/heads/"));
                prop_assert!(!request.target_ref["refs/heads/".len()..].starts_with("refs/heads"));
            }
        }

        /// A title with an empty body yields just the title; a non-empty body
        /// is appended after a blank line.
        #[test]
        fn description_composition(title in ".{0,30}", body in ".{0,30}") {
            let mut pr = test_pull_request(1);
            pr.title = Some(title.clone());
            pr.body = Some(body.clone());
            let request = convert_pull_request(&pr).unwrap();
            if body.is_empty() {
                prop_assert_eq!(request.description, title);
            } else {
                prop_assert_eq!(request.description, format!("{}\n\n{}", title, body));
            }
        }
    }
}
