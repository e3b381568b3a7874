//! Reconciliation of freshly fetched material with pre-existing notes.
//!
//! A pull request mirrored into notes and later read back does not compare
//! equal field-by-field: issue comments lose their location, and a comment
//! mirrored in the other direction comes back with a rewritten author and
//! timestamp, its original author quoted into the body. The overlap
//! relations below absorb exactly that loss, so a repeated mirror pass
//! appends nothing new.
//!
//! Write ordering is fixed: reports first, then for each review the request
//! before its comments.

use std::collections::HashMap;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::notes::{
    parse_all_valid, Comment, Location, Report, Request, Review, COMMENTS_REF, REPORTS_REF,
    REQUESTS_REF,
};
use crate::repository::Repository;

/// How a comment renders when quoted into another comment's body.
fn quote_comment(c: &Comment) -> String {
    format!("{}:\n\n{}", c.author, c.description)
}

fn descriptions_match(a: &Comment, b: &Comment) -> bool {
    a.author == b.author && a.description == b.description
}

fn descriptions_overlap(a: &Comment, b: &Comment) -> bool {
    descriptions_match(a, b) || a.description == quote_comment(b) || quote_comment(a) == b.description
}

fn location_paths_match(a: &Location, b: &Location) -> bool {
    a == b || (a.commit == b.commit && a.path == b.path)
}

fn locations_overlap(a: &Comment, b: &Comment) -> bool {
    match (&a.location, &b.location) {
        (None, None) => true,
        (None, Some(l)) | (Some(l), None) => l.path.is_empty(),
        (Some(la), Some(lb)) => location_paths_match(la, lb),
    }
}

/// Whether two comments are close enough that one can stand in for the
/// other.
///
/// Two comments overlap when they are identical, or when both their
/// locations and their descriptions overlap:
///
/// - locations overlap when they are equal, when both sides are
///   review-level and one lacks a commit, or when both sit in the same file
///   of the same commit;
/// - descriptions overlap when they match, or when one side reads as a
///   quote (`author:\n\ndescription`) of the other.
///
/// Some information is lost under this relation, but who said what is
/// preserved, and the same comment is never mirrored back and forth twice.
pub fn comments_overlap(a: &Comment, b: &Comment) -> bool {
    a == b || (locations_overlap(a, b) && descriptions_overlap(a, b))
}

/// Whether two review requests are close enough that one can stand in for
/// the other. Timestamps and reviewers are deliberately ignored: both are
/// rewritten when a request round-trips through the other format.
pub fn requests_overlap(a: &Request, b: &Request) -> bool {
    a.review_ref == b.review_ref
        && a.target_ref == b.target_ref
        && a.description == b.description
        && a.base_commit == b.base_commit
}

async fn emit(log: &mpsc::Sender<String>, message: String) {
    // A closed log consumer only loses progress output, never writes.
    let _ = log.send(message).await;
}

/// Append every report that is not already present, keyed by commit.
pub async fn write_new_reports(
    reports: &HashMap<String, Vec<Report>>,
    repo: &dyn Repository,
    log: &mpsc::Sender<String>,
) -> Result<()> {
    for (commit, commit_reports) in reports {
        let existing: Vec<Report> = parse_all_valid(&repo.get_notes(REPORTS_REF, commit).await?);
        for report in commit_reports {
            if existing.contains(report) {
                continue;
            }
            let note = serde_json::to_vec(report)?;
            emit(
                log,
                format!(
                    "Found a new report for {:.12}: {:?}",
                    commit,
                    String::from_utf8_lossy(&note)
                ),
            )
            .await;
            repo.append_note(REPORTS_REF, commit, &note).await?;
        }
    }
    Ok(())
}

/// Append every comment of a review that no existing comment overlaps.
pub async fn write_new_comments(
    review: &Review,
    repo: &dyn Repository,
    log: &mpsc::Sender<String>,
) -> Result<()> {
    let existing: Vec<Comment> =
        parse_all_valid(&repo.get_notes(COMMENTS_REF, &review.revision).await?);
    for thread in &review.comments {
        if existing
            .iter()
            .any(|e| comments_overlap(e, &thread.comment))
        {
            continue;
        }
        let note = thread.comment.write()?;
        emit(
            log,
            format!("Found a new comment: {:?}", String::from_utf8_lossy(&note)),
        )
        .await;
        repo.append_note(COMMENTS_REF, &review.revision, &note)
            .await?;
    }
    Ok(())
}

/// Write every review that has material not already present: the request
/// first, then its comments. A request that is already represented is not
/// re-appended, but its comments are still reconciled.
pub async fn write_new_reviews(
    reviews: &[Review],
    repo: &dyn Repository,
    log: &mpsc::Sender<String>,
) -> Result<()> {
    for review in reviews {
        let existing: Vec<Request> =
            parse_all_valid(&repo.get_notes(REQUESTS_REF, &review.revision).await?);
        if !existing.iter().any(|e| requests_overlap(e, &review.request)) {
            let note = review.request.write()?;
            emit(
                log,
                format!(
                    "Found a new review for {:.12}:\n{}",
                    review.revision,
                    String::from_utf8_lossy(&note)
                ),
            )
            .await;
            repo.append_note(REQUESTS_REF, &review.revision, &note)
                .await?;
        }
        write_new_comments(review, repo, log).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes::{CommentThread, Range, ReportStatus};
    use crate::repository::tests::FakeRepo;
    use proptest::prelude::*;

    fn review_level_comment(commit: &str) -> Comment {
        Comment {
            timestamp: "00000000".to_string(),
            author: "user@example.com".to_string(),
            location: Some(Location {
                commit: commit.to_string(),
                ..Default::default()
            }),
            description: "Please fix so and so...".to_string(),
            ..Default::default()
        }
    }

    fn issue_comment() -> Comment {
        Comment {
            timestamp: "FFFFFFFF".to_string(),
            author: "user@example.com".to_string(),
            description: "Please fix so and so...".to_string(),
            ..Default::default()
        }
    }

    fn test_request() -> Request {
        Request {
            timestamp: "00000000".to_string(),
            requester: "user@example.com".to_string(),
            target_ref: "refs/heads/dev".to_string(),
            review_ref: "refs/pull/42/head".to_string(),
            description: "Bug fixes".to_string(),
            base_commit: "ABCDEFG".to_string(),
            reviewers: Vec::new(),
        }
    }

    #[test]
    fn identical_comments_overlap() {
        let comment = review_level_comment("ABCDEFG");
        assert!(comments_overlap(&comment, &comment));
    }

    #[test]
    fn review_comments_at_different_commits_do_not_overlap() {
        assert!(!comments_overlap(
            &review_level_comment("ABCDEFG"),
            &review_level_comment("ABCDEFH")
        ));
    }

    #[test]
    fn review_comment_overlaps_issue_comment() {
        assert!(comments_overlap(
            &review_level_comment("ABCDEFG"),
            &issue_comment()
        ));
    }

    #[test]
    fn child_comments_overlap_despite_parent() {
        let parent_hash = review_level_comment("ABCDEFG").hash().unwrap();
        let review_child = Comment {
            timestamp: "FFFFFFFG".to_string(),
            author: "user2@example.com".to_string(),
            parent: Some(parent_hash),
            location: Some(Location {
                commit: "ABCDEFG".to_string(),
                ..Default::default()
            }),
            description: "Done".to_string(),
        };
        let issue_child = Comment {
            timestamp: "FFFFFFFH".to_string(),
            author: "user2@example.com".to_string(),
            description: "Done".to_string(),
            ..Default::default()
        };
        assert!(comments_overlap(&review_child, &issue_child));
    }

    #[test]
    fn quoted_comment_overlaps_original() {
        let original = issue_comment();
        let quoted = Comment {
            timestamp: "FFFFFFFF".to_string(),
            author: "mirror-bot".to_string(),
            description: format!("{}:\n\n{}", original.author, original.description),
            ..Default::default()
        };
        assert!(descriptions_overlap(&quoted, &original));
        assert!(comments_overlap(&quoted, &original));
    }

    #[test]
    fn line_comments_in_same_file_overlap() {
        let mut a = review_level_comment("ABCDEFG");
        a.location.as_mut().unwrap().path = "example.go".to_string();
        a.location.as_mut().unwrap().range = Some(Range { start_line: 14 });
        let mut b = a.clone();
        b.location.as_mut().unwrap().range = Some(Range { start_line: 20 });
        assert!(comments_overlap(&a, &b));
    }

    #[test]
    fn identical_requests_overlap() {
        let request = test_request();
        assert!(requests_overlap(&request, &request));
    }

    #[test]
    fn request_timestamps_do_not_matter() {
        let a = test_request();
        let mut b = a.clone();
        b.timestamp = "FFFFFFFF".to_string();
        assert!(requests_overlap(&a, &b));
    }

    #[test]
    fn requests_with_different_targets_do_not_overlap() {
        let a = test_request();
        let mut b = a.clone();
        b.target_ref = "refs/heads/master".to_string();
        assert!(!requests_overlap(&a, &b));
    }

    fn test_review() -> Review {
        let comment = issue_comment();
        let hash = comment.hash().unwrap();
        Review {
            revision: "C1".to_string(),
            request: test_request(),
            comments: vec![CommentThread { hash, comment }],
        }
    }

    fn log_channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(1000)
    }

    #[tokio::test]
    async fn write_new_reports_skips_existing() {
        let repo = FakeRepo::default();
        let (log, mut messages) = log_channel();

        let mut reports = HashMap::new();
        reports.insert(
            "C1".to_string(),
            vec![
                Report {
                    timestamp: "         1".to_string(),
                    status: Some(ReportStatus::Success),
                    url: "https://ci.example.com/1".to_string(),
                    agent: "ci".to_string(),
                },
                Report {
                    timestamp: "         2".to_string(),
                    status: Some(ReportStatus::Failure),
                    url: "https://ci.example.com/2".to_string(),
                    agent: "ci".to_string(),
                },
            ],
        );

        write_new_reports(&reports, &repo, &log).await.unwrap();
        assert_eq!(repo.notes_at(REPORTS_REF, "C1").len(), 2);

        write_new_reports(&reports, &repo, &log).await.unwrap();
        assert_eq!(repo.notes_at(REPORTS_REF, "C1").len(), 2);

        drop(log);
        let mut announced = 0;
        while messages.recv().await.is_some() {
            announced += 1;
        }
        assert_eq!(announced, 2);
    }

    #[tokio::test]
    async fn write_new_reviews_is_idempotent() {
        let repo = FakeRepo::default();
        let (log, mut messages) = log_channel();
        tokio::spawn(async move { while messages.recv().await.is_some() {} });

        let reviews = vec![test_review()];
        write_new_reviews(&reviews, &repo, &log).await.unwrap();
        let after_first = repo.total_notes();
        assert_eq!(after_first, 2); // one request, one comment

        write_new_reviews(&reviews, &repo, &log).await.unwrap();
        assert_eq!(repo.total_notes(), after_first);
    }

    #[tokio::test]
    async fn existing_request_still_reconciles_comments() {
        let repo = FakeRepo::default();
        let (log, mut messages) = log_channel();
        tokio::spawn(async move { while messages.recv().await.is_some() {} });

        let mut review = test_review();
        write_new_reviews(&[review.clone()], &repo, &log)
            .await
            .unwrap();

        // Same request, one extra comment: only the comment is appended.
        let extra = Comment {
            timestamp: "FFFFFFF0".to_string(),
            author: "another@example.com".to_string(),
            description: "One more thing".to_string(),
            ..Default::default()
        };
        review.comments.push(CommentThread {
            hash: extra.hash().unwrap(),
            comment: extra,
        });
        write_new_reviews(&[review], &repo, &log).await.unwrap();

        assert_eq!(repo.notes_at(REQUESTS_REF, "C1").len(), 1);
        assert_eq!(repo.notes_at(COMMENTS_REF, "C1").len(), 2);
    }

    #[tokio::test]
    async fn mirrored_quote_is_not_duplicated() {
        let repo = FakeRepo::default();
        let (log, mut messages) = log_channel();
        tokio::spawn(async move { while messages.recv().await.is_some() {} });

        // A comment previously mirrored back from the other format: the
        // author header was quoted into the body.
        let original = issue_comment();
        let quoted = Comment {
            timestamp: "EEEEEEEE".to_string(),
            author: "mirror-bot".to_string(),
            description: format!("{}:\n\n{}", original.author, original.description),
            ..Default::default()
        };
        repo.append_note(COMMENTS_REF, "C1", &quoted.write().unwrap())
            .await
            .unwrap();

        let review = Review {
            revision: "C1".to_string(),
            request: test_request(),
            comments: vec![CommentThread {
                hash: original.hash().unwrap(),
                comment: original,
            }],
        };
        write_new_reviews(&[review], &repo, &log).await.unwrap();
        assert_eq!(repo.notes_at(COMMENTS_REF, "C1").len(), 1);
    }

    fn arb_comment() -> impl Strategy<Value = Comment> {
        (
            "[a-z]{1,8}",
            "[ -~]{0,20}",
            proptest::option::of(("[A-F0-9]{7}", "[a-z./]{0,10}")),
        )
            .prop_map(|(author, description, location)| Comment {
                timestamp: "00000000".to_string(),
                author,
                description,
                location: location.map(|(commit, path)| Location {
                    commit,
                    path,
                    ..Default::default()
                }),
                ..Default::default()
            })
    }

    proptest! {
        /// Overlap is reflexive.
        #[test]
        fn overlap_is_reflexive(comment in arb_comment()) {
            prop_assert!(comments_overlap(&comment, &comment));
        }

        /// Overlap is symmetric.
        #[test]
        fn overlap_is_symmetric(a in arb_comment(), b in arb_comment()) {
            prop_assert_eq!(comments_overlap(&a, &b), comments_overlap(&b, &a));
        }

        /// Requests that differ only in timestamp overlap; requests that
        /// differ in target ref never do.
        #[test]
        fn request_overlap_ignores_timestamp(timestamp in "[0-9A-F]{8}", target in "[a-z]{1,10}") {
            let a = test_request();
            let mut b = a.clone();
            b.timestamp = timestamp;
            prop_assert!(requests_overlap(&a, &b));

            b.target_ref = format!("refs/heads/{}", target);
            prop_assert_eq!(requests_overlap(&a, &b), a.target_ref == b.target_ref);
        }
    }
}
