//! Issue Correlation Engine
//!
//! Turns raw incident rows from the results store into deduplicated, ranked
//! regression summaries:
//!
//! - new-issue selection over a trailing detection window
//! - first-incident correlation with checkout metadata
//! - per-platform ranking of boot-path test incidents
//! - last-known-good search to bound a regression window
//!
//! All queries are read-only and parameterized. Empty result sets are
//! normal outcomes (no new issues, no known-good baseline), never errors.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::ToSql;
use tracing::debug;

use crate::db::{format_ts, Db, Row, RowExt};

/// Query policy for new-issue selection.
///
/// The two historical variants of this query (3-day window with an
/// unrestricted incident union vs 4-day window restricted to boot paths)
/// are one component parameterized by `window_days` and `boot_paths_only`.
#[derive(Debug, Clone)]
pub struct IssueQueryOptions {
    /// Origin tag issues and incidents are filtered to
    pub origin: String,
    /// Trailing detection window in days
    pub window_days: i64,
    /// Restrict the test side of the first-incident union to boot paths
    pub boot_paths_only: bool,
    /// Comment substring marking issues that are not real regressions
    pub exclude_comment_marker: String,
}

impl From<&crate::config::QueryConfig> for IssueQueryOptions {
    fn from(config: &crate::config::QueryConfig) -> Self {
        Self {
            origin: config.origin.clone(),
            window_days: config.window_days,
            boot_paths_only: config.boot_paths_only,
            exclude_comment_marker: config.exclude_comment_marker.clone(),
        }
    }
}

/// A newly detected (or individually resolved) issue with its first
/// incident and checkout metadata joined in.
#[derive(Debug, Clone)]
pub struct IssueSummary {
    pub timestamp: DateTime<Utc>,
    pub id: String,
    pub version: i64,
    pub comment: Option<String>,
    pub misc: Option<String>,
    pub build_id: Option<String>,
    pub test_id: Option<String>,
    pub git_repository_url: Option<String>,
    pub tree_name: Option<String>,
    pub git_repository_branch: Option<String>,
    pub git_commit_hash: Option<String>,
    pub git_commit_name: Option<String>,
    /// Total incidents ever linked to this issue id, not window-bounded
    pub incident_count: i64,
}

/// Newest build per distinct (config_name, architecture, compiler) triple
/// among an issue's build incidents.
#[derive(Debug, Clone)]
pub struct BuildIncident {
    pub build_id: String,
    pub config_name: Option<String>,
    pub architecture: Option<String>,
    pub compiler: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One row per platform among an issue's boot-path test incidents: the
/// most recent incident, annotated with the platform's incident count and
/// oldest incident timestamp.
#[derive(Debug, Clone)]
pub struct PlatformIncident {
    pub test_id: String,
    pub path: String,
    pub status: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    pub platform: Option<String>,
    pub platform_count: i64,
    pub oldest_timestamp: DateTime<Utc>,
}

/// The most recent passing run preceding a regression's detection
#[derive(Debug, Clone)]
pub struct LastKnownGood {
    pub test_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    pub git_commit_hash: Option<String>,
    pub git_repository_url: Option<String>,
    pub tree_name: Option<String>,
    pub git_repository_branch: Option<String>,
}

/// One recent test run on a tree/branch (recent-history context)
#[derive(Debug, Clone)]
pub struct TestResult {
    pub test_id: String,
    pub path: String,
    pub status: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub architecture: Option<String>,
    pub compiler: Option<String>,
    pub git_commit_hash: Option<String>,
    pub git_commit_name: Option<String>,
}

fn issue_summary_from_row(row: &Row) -> Result<IssueSummary> {
    Ok(IssueSummary {
        timestamp: row.ts_field("_timestamp")?,
        id: row.str_field("id")?,
        version: row.i64_field("version")?,
        comment: row.opt_str("comment"),
        misc: row.opt_str("misc"),
        build_id: row.opt_str("build_id"),
        test_id: row.opt_str("test_id"),
        git_repository_url: row.opt_str("git_repository_url"),
        tree_name: row.opt_str("tree_name"),
        git_repository_branch: row.opt_str("git_repository_branch"),
        git_commit_hash: row.opt_str("git_commit_hash"),
        git_commit_name: row.opt_str("git_commit_name"),
        incident_count: row.i64_field("incident_count")?,
    })
}

/// Select issues first surfaced within the trailing detection window.
///
/// One row per issue id (highest version only), newest first. An issue
/// with any incident strictly older than the window start is pre-existing
/// and excluded; detection is an anti-join on issue id, so column drift
/// between subqueries cannot resurrect excluded issues. `incident_count`
/// is the all-time total for the id.
pub fn new_issues(db: &Db, opts: &IssueQueryOptions) -> Result<Vec<IssueSummary>> {
    let window_start = format_ts(Utc::now() - Duration::days(opts.window_days));
    let marker = format!("%{}%", opts.exclude_comment_marker);

    debug!(
        "Selecting new issues: origin={} window={}d boot_paths_only={}",
        opts.origin, opts.window_days, opts.boot_paths_only
    );

    let sql = "
        WITH ranked_issues AS (
            SELECT
                i._timestamp,
                i.id,
                i.version,
                i.comment,
                i.misc,
                ROW_NUMBER() OVER (PARTITION BY i.id ORDER BY i.version DESC) AS rn
            FROM issues i
            WHERE i.origin = :origin
                AND i._timestamp >= :window_start
                AND i.comment NOT LIKE :comment_marker
        ),

        highest_version AS (
            SELECT _timestamp, id, version, comment, misc
            FROM ranked_issues
            WHERE rn = 1
        ),

        new_issues AS (
            SELECT h._timestamp, h.id, h.version, h.comment, h.misc
            FROM highest_version h
            WHERE NOT EXISTS (
                    SELECT 1 FROM incidents old
                    WHERE old.issue_id = h.id
                        AND old._timestamp < :window_start
                )
                AND EXISTS (
                    SELECT 1 FROM incidents any_inc
                    WHERE any_inc.issue_id = h.id
                )
        ),

        first_incidents AS (
            SELECT
                issue_id,
                issue_version,
                test_id,
                build_id,
                git_repository_url,
                tree_name,
                git_repository_branch,
                git_commit_hash,
                git_commit_name,
                ROW_NUMBER() OVER (
                    PARTITION BY issue_id ORDER BY _timestamp ASC
                ) AS incident_rn
            FROM (
                SELECT
                    inc.issue_id,
                    inc.issue_version,
                    inc.test_id,
                    inc.build_id,
                    inc._timestamp,
                    c.git_repository_url,
                    c.tree_name,
                    c.git_repository_branch,
                    c.git_commit_hash,
                    c.git_commit_name
                FROM incidents inc
                JOIN builds b ON inc.build_id = b.id
                JOIN checkouts c ON b.checkout_id = c.id
                WHERE inc.origin = :origin
                    AND inc._timestamp >= :window_start

                UNION

                SELECT
                    inc.issue_id,
                    inc.issue_version,
                    inc.test_id,
                    inc.build_id,
                    inc._timestamp,
                    c.git_repository_url,
                    c.tree_name,
                    c.git_repository_branch,
                    c.git_commit_hash,
                    c.git_commit_name
                FROM incidents inc
                JOIN tests t ON inc.test_id = t.id
                JOIN builds b ON t.build_id = b.id
                JOIN checkouts c ON b.checkout_id = c.id
                WHERE inc.origin = :origin
                    AND inc._timestamp >= :window_start
                    AND (:boot_only = 0 OR t.path IN ('boot', 'boot.nfs'))
            )
        )

        SELECT
            n._timestamp,
            n.id,
            n.version,
            n.comment,
            n.misc,
            fi.build_id,
            fi.test_id,
            fi.git_repository_url,
            fi.tree_name,
            fi.git_repository_branch,
            fi.git_commit_hash,
            fi.git_commit_name,
            COUNT(inc.id) AS incident_count
        FROM new_issues n
        LEFT JOIN first_incidents fi ON n.id = fi.issue_id AND fi.incident_rn = 1
        LEFT JOIN incidents inc ON n.id = inc.issue_id
        GROUP BY
            n._timestamp, n.id, n.version, n.comment, n.misc,
            fi.build_id, fi.test_id,
            fi.git_repository_url, fi.tree_name, fi.git_repository_branch,
            fi.git_commit_hash, fi.git_commit_name
        ORDER BY n._timestamp DESC";

    let params: &[(&str, &dyn ToSql)] = &[
        (":origin", &opts.origin),
        (":window_start", &window_start),
        (":comment_marker", &marker),
        (":boot_only", &opts.boot_paths_only),
    ];

    let rows = db.query(sql, params)?;
    rows.iter().map(issue_summary_from_row).collect()
}

/// Resolve the most recent version of a single issue, no windowing.
///
/// Same projection as [`new_issues`], but the first-incident union is
/// never path-restricted. Zero or one row.
pub fn issue_details(db: &Db, issue_id: &str) -> Result<Option<IssueSummary>> {
    let sql = "
        WITH our_issue AS (
            SELECT _timestamp, id, version, comment, misc
            FROM issues
            WHERE id = :issue_id
            ORDER BY version DESC
            LIMIT 1
        ),

        first_incidents AS (
            SELECT
                issue_id,
                issue_version,
                test_id,
                build_id,
                git_repository_url,
                tree_name,
                git_repository_branch,
                git_commit_hash,
                git_commit_name,
                ROW_NUMBER() OVER (
                    PARTITION BY issue_id ORDER BY _timestamp ASC
                ) AS incident_rn
            FROM (
                SELECT
                    inc.issue_id,
                    inc.issue_version,
                    inc.test_id,
                    inc.build_id,
                    inc._timestamp,
                    c.git_repository_url,
                    c.tree_name,
                    c.git_repository_branch,
                    c.git_commit_hash,
                    c.git_commit_name
                FROM incidents inc
                JOIN builds b ON inc.build_id = b.id
                JOIN checkouts c ON b.checkout_id = c.id
                WHERE inc.issue_id = :issue_id

                UNION

                SELECT
                    inc.issue_id,
                    inc.issue_version,
                    inc.test_id,
                    inc.build_id,
                    inc._timestamp,
                    c.git_repository_url,
                    c.tree_name,
                    c.git_repository_branch,
                    c.git_commit_hash,
                    c.git_commit_name
                FROM incidents inc
                JOIN tests t ON inc.test_id = t.id
                JOIN builds b ON t.build_id = b.id
                JOIN checkouts c ON b.checkout_id = c.id
                WHERE inc.issue_id = :issue_id
            )
        )

        SELECT
            n._timestamp,
            n.id,
            n.version,
            n.comment,
            n.misc,
            fi.build_id,
            fi.test_id,
            fi.git_repository_url,
            fi.tree_name,
            fi.git_repository_branch,
            fi.git_commit_hash,
            fi.git_commit_name,
            COUNT(inc.id) AS incident_count
        FROM our_issue n
        LEFT JOIN first_incidents fi ON n.id = fi.issue_id AND fi.incident_rn = 1
        LEFT JOIN incidents inc ON n.id = inc.issue_id
        GROUP BY
            n._timestamp, n.id, n.version, n.comment, n.misc,
            fi.build_id, fi.test_id,
            fi.git_repository_url, fi.tree_name, fi.git_repository_branch,
            fi.git_commit_hash, fi.git_commit_name";

    let params: &[(&str, &dyn ToSql)] = &[(":issue_id", &issue_id)];
    let rows = db.query(sql, params)?;

    rows.first().map(issue_summary_from_row).transpose()
}

/// List the most recent build per distinct (config_name, architecture,
/// compiler) triple among an issue's build incidents.
pub fn build_incidents(db: &Db, issue_id: &str) -> Result<Vec<BuildIncident>> {
    let sql = "
        WITH ranked_builds AS (
            SELECT
                b.id,
                b.config_name,
                b.architecture,
                b.compiler,
                b._timestamp,
                ROW_NUMBER() OVER (
                    PARTITION BY b.config_name, b.architecture, b.compiler
                    ORDER BY b._timestamp DESC
                ) AS rn
            FROM builds b
            JOIN incidents inc ON inc.build_id = b.id
            WHERE inc.issue_id = :issue_id
        )
        SELECT id, config_name, architecture, compiler, _timestamp
        FROM ranked_builds
        WHERE rn = 1
        ORDER BY config_name, architecture, compiler";

    let params: &[(&str, &dyn ToSql)] = &[(":issue_id", &issue_id)];
    let rows = db.query(sql, params)?;

    rows.iter()
        .map(|row| {
            Ok(BuildIncident {
                build_id: row.str_field("id")?,
                config_name: row.opt_str("config_name"),
                architecture: row.opt_str("architecture"),
                compiler: row.opt_str("compiler"),
                timestamp: row.ts_field("_timestamp")?,
            })
        })
        .collect()
}

/// Rank an issue's boot-path test incidents per platform.
///
/// Exactly one row per distinct platform: the most recent incident,
/// annotated with the platform's incident count and oldest incident
/// timestamp. Only `boot` and `boot.nfs` paths are considered.
pub fn test_incidents(db: &Db, issue_id: &str) -> Result<Vec<PlatformIncident>> {
    let sql = "
        WITH ranked_tests AS (
            SELECT
                t.id,
                t.path,
                t.status,
                t.start_time,
                t._timestamp,
                json_extract(t.environment_misc, '$.platform') AS platform,
                COUNT(*) OVER (
                    PARTITION BY json_extract(t.environment_misc, '$.platform')
                ) AS platform_count,
                MIN(t._timestamp) OVER (
                    PARTITION BY json_extract(t.environment_misc, '$.platform')
                ) AS oldest_timestamp,
                ROW_NUMBER() OVER (
                    PARTITION BY json_extract(t.environment_misc, '$.platform')
                    ORDER BY t._timestamp DESC
                ) AS rn_newest
            FROM tests t
            JOIN incidents inc ON inc.test_id = t.id
            WHERE inc.issue_id = :issue_id
                AND t.path IN ('boot', 'boot.nfs')
        )
        SELECT id, path, status, start_time, _timestamp,
               platform, platform_count, oldest_timestamp
        FROM ranked_tests
        WHERE rn_newest = 1
        ORDER BY platform";

    let params: &[(&str, &dyn ToSql)] = &[(":issue_id", &issue_id)];
    let rows = db.query(sql, params)?;

    rows.iter()
        .map(|row| {
            Ok(PlatformIncident {
                test_id: row.str_field("id")?,
                path: row.str_field("path")?,
                status: row.opt_str("status"),
                start_time: row.opt_ts("start_time")?,
                timestamp: row.ts_field("_timestamp")?,
                platform: row.opt_str("platform"),
                platform_count: row.i64_field("platform_count")?,
                oldest_timestamp: row.ts_field("oldest_timestamp")?,
            })
        })
        .collect()
}

fn last_known_good_from_row(row: &Row) -> Result<LastKnownGood> {
    Ok(LastKnownGood {
        test_id: row.str_field("id")?,
        start_time: row.opt_ts("start_time")?,
        timestamp: row.ts_field("_timestamp")?,
        git_commit_hash: row.opt_str("git_commit_hash"),
        git_repository_url: row.opt_str("git_repository_url"),
        tree_name: row.opt_str("tree_name"),
        git_repository_branch: row.opt_str("git_repository_branch"),
    })
}

/// Find the most recent passing run before an incident's oldest timestamp,
/// same origin/platform/path/repo/branch, any commit.
///
/// The candidate pool is capped at 10 rows before the top-1 ranking. An
/// empty result means no known-good baseline exists in range.
pub fn last_known_good(
    db: &Db,
    origin: &str,
    issue: &IssueSummary,
    incident: &PlatformIncident,
) -> Result<Option<LastKnownGood>> {
    let (Some(giturl), Some(branch), Some(platform)) = (
        issue.git_repository_url.as_deref(),
        issue.git_repository_branch.as_deref(),
        incident.platform.as_deref(),
    ) else {
        debug!("Issue {} lacks checkout or platform metadata, skipping baseline search", issue.id);
        return Ok(None);
    };
    let before = format_ts(incident.oldest_timestamp);

    let sql = "
        WITH ranked_tests AS (
            SELECT
                t.id,
                t.path,
                t.status,
                t.start_time,
                t._timestamp,
                c.git_repository_url,
                c.tree_name,
                c.git_repository_branch,
                c.git_commit_hash,
                ROW_NUMBER() OVER (
                    PARTITION BY json_extract(t.environment_misc, '$.platform'), t.path
                    ORDER BY t._timestamp DESC
                ) AS rn
            FROM tests t
            JOIN builds b ON b.id = t.build_id
            JOIN checkouts c ON c.id = b.checkout_id
            WHERE t.origin = :origin
                AND t._timestamp < :before
                AND json_extract(t.environment_misc, '$.platform') = :platform
                AND t.path = :path
                AND t.status = 'PASS'
                AND c.git_repository_url = :giturl
                AND c.git_repository_branch = :branch
            LIMIT 10
        )
        SELECT id, start_time, _timestamp, git_commit_hash,
               git_repository_url, tree_name, git_repository_branch
        FROM ranked_tests
        WHERE rn = 1";

    let params: &[(&str, &dyn ToSql)] = &[
        (":origin", &origin),
        (":before", &before),
        (":platform", &platform),
        (":path", &incident.path),
        (":giturl", &giturl),
        (":branch", &branch),
    ];

    let rows = db.query(sql, params)?;
    rows.first().map(last_known_good_from_row).transpose()
}

/// Strict last-known-good search: additionally excludes every commit seen
/// in the checkout of any incident already linked to this issue, and
/// bounds the search to a trailing lookback window. At most one row,
/// newest first.
pub fn last_known_good_strict(
    db: &Db,
    origin: &str,
    issue: &IssueSummary,
    incident: &PlatformIncident,
    lookback_days: i64,
) -> Result<Option<LastKnownGood>> {
    let (Some(giturl), Some(branch), Some(platform)) = (
        issue.git_repository_url.as_deref(),
        issue.git_repository_branch.as_deref(),
        incident.platform.as_deref(),
    ) else {
        debug!("Issue {} lacks checkout or platform metadata, skipping baseline search", issue.id);
        return Ok(None);
    };
    let before = format_ts(incident.oldest_timestamp);
    let lookback_start = format_ts(Utc::now() - Duration::days(lookback_days));

    let sql = "
        WITH known_bad_commits AS (
            SELECT DISTINCT c.git_commit_hash
            FROM tests t
            JOIN builds b ON t.build_id = b.id
            JOIN checkouts c ON b.checkout_id = c.id
            JOIN incidents inc ON inc.test_id = t.id
            WHERE inc.issue_id = :issue_id
        )
        SELECT
            t.id,
            t.start_time,
            t._timestamp,
            c.git_commit_hash,
            c.git_repository_url,
            c.tree_name,
            c.git_repository_branch
        FROM tests t
        JOIN builds b ON t.build_id = b.id
        JOIN checkouts c ON b.checkout_id = c.id
        WHERE c.git_repository_url = :giturl
            AND c.git_repository_branch = :branch
            AND json_extract(t.environment_misc, '$.platform') = :platform
            AND t.path = :path
            AND t.status = 'PASS'
            AND c.origin = :origin
            AND t._timestamp < :before
            AND t._timestamp >= :lookback_start
            AND c.git_commit_hash NOT IN (
                SELECT git_commit_hash FROM known_bad_commits
            )
        ORDER BY t._timestamp DESC
        LIMIT 1";

    let params: &[(&str, &dyn ToSql)] = &[
        (":issue_id", &issue.id),
        (":origin", &origin),
        (":before", &before),
        (":lookback_start", &lookback_start),
        (":platform", &platform),
        (":path", &incident.path),
        (":giturl", &giturl),
        (":branch", &branch),
    ];

    let rows = db.query(sql, params)?;
    rows.first().map(last_known_good_from_row).transpose()
}

/// Recent run history on a tree/branch: the last 10 runs per test path
/// matching `path_pattern` (SQL LIKE), within the lookback window.
pub fn tests_results(
    db: &Db,
    origin: &str,
    giturl: &str,
    branch: &str,
    path_pattern: &str,
    lookback_days: i64,
) -> Result<Vec<TestResult>> {
    let lookback_start = format_ts(Utc::now() - Duration::days(lookback_days));

    let sql = "
        WITH ranked_tests AS (
            SELECT
                t.id,
                t.path,
                t.status,
                t.start_time,
                b.architecture,
                b.compiler,
                c.git_commit_hash,
                c.git_commit_name,
                ROW_NUMBER() OVER (
                    PARTITION BY t.path
                    ORDER BY t.start_time DESC NULLS LAST
                ) AS rn
            FROM tests t
            JOIN builds b ON t.build_id = b.id
            JOIN checkouts c ON b.checkout_id = c.id
            WHERE t.origin = :origin
                AND c.git_repository_url = :giturl
                AND c.git_repository_branch = :branch
                AND t.path LIKE :path
                AND c._timestamp >= :lookback_start
                AND b._timestamp >= :lookback_start
                AND t._timestamp >= :lookback_start
        )
        SELECT id, path, status, start_time,
               architecture, compiler, git_commit_hash, git_commit_name
        FROM ranked_tests
        WHERE rn <= 10
        ORDER BY path, start_time DESC NULLS LAST";

    let params: &[(&str, &dyn ToSql)] = &[
        (":origin", &origin),
        (":giturl", &giturl),
        (":branch", &branch),
        (":path", &path_pattern),
        (":lookback_start", &lookback_start),
    ];

    let rows = db.query(sql, params)?;
    rows.iter()
        .map(|row| {
            Ok(TestResult {
                test_id: row.str_field("id")?,
                path: row.str_field("path")?,
                status: row.opt_str("status"),
                start_time: row.opt_ts("start_time")?,
                architecture: row.opt_str("architecture"),
                compiler: row.opt_str("compiler"),
                git_commit_hash: row.opt_str("git_commit_hash"),
                git_commit_name: row.opt_str("git_commit_name"),
            })
        })
        .collect()
}
