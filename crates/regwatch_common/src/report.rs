//! Report Composition
//!
//! Renders correlation results into the plain-text reports the mailer
//! sends. Output is deterministic for a given input.

use std::fmt::Write;

use crate::issues::{BuildIncident, IssueSummary, LastKnownGood, PlatformIncident};

/// A composed report: mail subject and plain-text body
#[derive(Debug, Clone)]
pub struct Report {
    pub title: String,
    pub content: String,
}

/// Everything known about one new issue, ready for rendering
pub struct IssueReportData {
    pub issue: IssueSummary,
    pub builds: Vec<BuildIncident>,
    /// Per-platform ranking, each with its last-known-good baseline if any
    pub platforms: Vec<(PlatformIncident, Option<LastKnownGood>)>,
}

fn or_unknown(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("unknown")
}

/// Web URL for an issue, derived from the API base URL
pub fn issue_url(api_base: &str, issue_id: &str) -> String {
    let root = api_base.trim_end_matches('/').trim_end_matches("/api");
    format!("{root}/issue/{issue_id}")
}

/// Compose the report for one new issue
pub fn compose(api_base: &str, data: &IssueReportData) -> Report {
    let issue = &data.issue;

    let tree = or_unknown(&issue.tree_name);
    let branch = or_unknown(&issue.git_repository_branch);
    let headline = issue
        .comment
        .as_deref()
        .unwrap_or(&issue.id)
        .lines()
        .next()
        .unwrap_or(&issue.id)
        .to_string();

    let title = format!("[REGRESSION] {tree}/{branch}: {headline}");

    let mut body = String::new();
    let _ = writeln!(body, "New issue detected: {}", issue.id);
    let _ = writeln!(body, "Version:        {}", issue.version);
    let _ = writeln!(body, "Detected at:    {}", issue.timestamp.to_rfc3339());
    let _ = writeln!(body, "Tree / branch:  {tree}/{branch}");
    let _ = writeln!(
        body,
        "Commit:         {} ({})",
        or_unknown(&issue.git_commit_hash),
        or_unknown(&issue.git_commit_name)
    );
    let _ = writeln!(body, "Repository:     {}", or_unknown(&issue.git_repository_url));
    let _ = writeln!(body, "Incidents:      {}", issue.incident_count);
    let _ = writeln!(body, "Dashboard:      {}", issue_url(api_base, &issue.id));
    if let Some(comment) = issue.comment.as_deref() {
        let _ = writeln!(body, "\n{comment}");
    }

    if !data.builds.is_empty() {
        let _ = writeln!(body, "\nAffected builds:");
        for build in &data.builds {
            let _ = writeln!(
                body,
                "  {} / {} / {}  (latest {}, build {})",
                or_unknown(&build.config_name),
                or_unknown(&build.architecture),
                or_unknown(&build.compiler),
                build.timestamp.to_rfc3339(),
                build.build_id,
            );
        }
    }

    if !data.platforms.is_empty() {
        let _ = writeln!(body, "\nAffected platforms (boot tests):");
        for (incident, baseline) in &data.platforms {
            let platform = incident.platform.as_deref().unwrap_or("unknown");
            let _ = writeln!(
                body,
                "  {platform}: {} incident(s), first seen {}, last seen {}",
                incident.platform_count,
                incident.oldest_timestamp.to_rfc3339(),
                incident.timestamp.to_rfc3339(),
            );
            match baseline {
                Some(good) => {
                    let _ = writeln!(
                        body,
                        "    last known good: {} at {} (test {})",
                        or_unknown(&good.git_commit_hash),
                        good.timestamp.to_rfc3339(),
                        good.test_id,
                    );
                }
                None => {
                    let _ = writeln!(body, "    last known good: none found in range");
                }
            }
        }
    }

    Report { title, content: body }
}
