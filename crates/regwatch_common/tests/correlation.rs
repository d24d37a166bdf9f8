//! Correlation engine tests against an in-memory results database.
//!
//! The fixture mirrors the subset of the results schema the queries touch:
//! issues, incidents, builds, tests, checkouts.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};

use regwatch_common::db::{format_ts, Db};
use regwatch_common::issues::{self, IssueQueryOptions};

const ORIGIN: &str = "maestro";
const GITURL: &str = "https://git.example.org/linux.git";
const BRANCH: &str = "master";

fn schema() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE issues (
             id TEXT NOT NULL,
             version INTEGER NOT NULL,
             origin TEXT NOT NULL,
             comment TEXT,
             misc TEXT,
             _timestamp TEXT NOT NULL
         );
         CREATE TABLE incidents (
             id TEXT PRIMARY KEY,
             origin TEXT NOT NULL,
             issue_id TEXT NOT NULL,
             issue_version INTEGER NOT NULL,
             build_id TEXT,
             test_id TEXT,
             _timestamp TEXT NOT NULL
         );
         CREATE TABLE builds (
             id TEXT PRIMARY KEY,
             checkout_id TEXT NOT NULL,
             origin TEXT NOT NULL,
             config_name TEXT,
             architecture TEXT,
             compiler TEXT,
             _timestamp TEXT NOT NULL
         );
         CREATE TABLE tests (
             id TEXT PRIMARY KEY,
             build_id TEXT NOT NULL,
             origin TEXT NOT NULL,
             path TEXT NOT NULL,
             status TEXT,
             start_time TEXT,
             environment_misc TEXT,
             _timestamp TEXT NOT NULL
         );
         CREATE TABLE checkouts (
             id TEXT PRIMARY KEY,
             origin TEXT NOT NULL,
             tree_name TEXT,
             git_repository_url TEXT,
             git_repository_branch TEXT,
             git_commit_hash TEXT,
             git_commit_name TEXT,
             _timestamp TEXT NOT NULL
         );",
    )
    .unwrap();
    conn
}

fn ago(days: i64, hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days) - Duration::hours(hours)
}

fn insert_checkout(conn: &Connection, id: &str, hash: &str, ts: DateTime<Utc>) {
    conn.execute(
        "INSERT INTO checkouts VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, ORIGIN, "mainline", GITURL, BRANCH, hash, format!("tag-{hash}"), format_ts(ts)],
    )
    .unwrap();
}

fn insert_build(conn: &Connection, id: &str, checkout_id: &str, config: &str, arch: &str, compiler: &str, ts: DateTime<Utc>) {
    conn.execute(
        "INSERT INTO builds VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![id, checkout_id, ORIGIN, config, arch, compiler, format_ts(ts)],
    )
    .unwrap();
}

fn insert_test(conn: &Connection, id: &str, build_id: &str, path: &str, status: &str, platform: &str, ts: DateTime<Utc>) {
    let env = format!(r#"{{"platform": "{platform}"}}"#);
    conn.execute(
        "INSERT INTO tests VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, build_id, ORIGIN, path, status, format_ts(ts), env, format_ts(ts)],
    )
    .unwrap();
}

fn insert_issue(conn: &Connection, id: &str, version: i64, comment: &str, ts: DateTime<Utc>) {
    conn.execute(
        "INSERT INTO issues VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
        params![id, version, ORIGIN, comment, format_ts(ts)],
    )
    .unwrap();
}

fn insert_incident(
    conn: &Connection,
    id: &str,
    issue_id: &str,
    issue_version: i64,
    build_id: Option<&str>,
    test_id: Option<&str>,
    ts: DateTime<Utc>,
) {
    conn.execute(
        "INSERT INTO incidents VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![id, ORIGIN, issue_id, issue_version, build_id, test_id, format_ts(ts)],
    )
    .unwrap();
}

fn default_opts() -> IssueQueryOptions {
    IssueQueryOptions {
        origin: ORIGIN.to_string(),
        window_days: 4,
        boot_paths_only: true,
        exclude_comment_marker: "error_return_code".to_string(),
    }
}

/// Issue with a boot test incident, first observed `days` days ago
fn seed_boot_issue(conn: &Connection, issue_id: &str, suffix: &str, platform: &str, ts: DateTime<Utc>) {
    insert_checkout(conn, &format!("c-{suffix}"), &format!("hash-{suffix}"), ts);
    insert_build(conn, &format!("b-{suffix}"), &format!("c-{suffix}"), "defconfig", "arm64", "gcc-12", ts);
    insert_test(conn, &format!("t-{suffix}"), &format!("b-{suffix}"), "boot", "FAIL", platform, ts);
    insert_incident(conn, &format!("i-{suffix}"), issue_id, 1, None, Some(&format!("t-{suffix}")), ts);
}

#[test]
fn new_issue_with_single_recent_incident_is_included() {
    let conn = schema();
    let detected = ago(0, 1);
    insert_issue(&conn, "issue-a", 1, "boot failure", detected);
    seed_boot_issue(&conn, "issue-a", "a1", "qemu-arm", detected);
    let db = Db::new(conn);

    let rows = issues::new_issues(&db, &default_opts()).unwrap();
    assert_eq!(rows.len(), 1);

    let row = &rows[0];
    assert_eq!(row.id, "issue-a");
    assert_eq!(row.incident_count, 1);
    assert_eq!(row.test_id.as_deref(), Some("t-a1"));
    assert_eq!(row.git_commit_hash.as_deref(), Some("hash-a1"));
    assert_eq!(row.tree_name.as_deref(), Some("mainline"));
    assert_eq!(row.git_repository_branch.as_deref(), Some(BRANCH));
}

#[test]
fn issue_with_incident_older_than_window_is_excluded() {
    let conn = schema();
    // Versions 1 and 2; incidents one day and five days old, window 4 days
    insert_issue(&conn, "issue-i1", 1, "boot failure", ago(5, 0));
    insert_issue(&conn, "issue-i1", 2, "boot failure", ago(1, 0));
    seed_boot_issue(&conn, "issue-i1", "old", "qemu-arm", ago(5, 0));
    seed_boot_issue(&conn, "issue-i1", "new", "qemu-arm", ago(1, 0));
    let db = Db::new(conn);

    let rows = issues::new_issues(&db, &default_opts()).unwrap();
    assert!(rows.is_empty());
}

#[test]
fn only_highest_version_is_emitted_once() {
    let conn = schema();
    insert_issue(&conn, "issue-v", 1, "first sighting", ago(2, 0));
    insert_issue(&conn, "issue-v", 2, "second sighting", ago(1, 0));
    seed_boot_issue(&conn, "issue-v", "v1", "qemu-x86", ago(1, 0));
    let db = Db::new(conn);

    let rows = issues::new_issues(&db, &default_opts()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].version, 2);
    assert_eq!(rows[0].comment.as_deref(), Some("second sighting"));
}

#[test]
fn incident_count_is_all_time_total_across_incident_kinds() {
    let conn = schema();
    let ts = ago(1, 0);
    insert_issue(&conn, "issue-c", 1, "boot failure", ts);

    insert_checkout(&conn, "c-c", "hash-c", ts);
    insert_build(&conn, "b-c", "c-c", "defconfig", "arm64", "gcc-12", ts);
    insert_test(&conn, "t-boot", "b-c", "boot", "FAIL", "qemu-arm", ts);
    insert_test(&conn, "t-other", "b-c", "kselftest.timers", "FAIL", "qemu-arm", ts);

    // One build incident, one boot test incident, one non-boot test incident
    insert_incident(&conn, "i-1", "issue-c", 1, Some("b-c"), None, ts);
    insert_incident(&conn, "i-2", "issue-c", 1, None, Some("t-boot"), ago(0, 20));
    insert_incident(&conn, "i-3", "issue-c", 1, None, Some("t-other"), ago(0, 18));
    let db = Db::new(conn);

    let rows = issues::new_issues(&db, &default_opts()).unwrap();
    assert_eq!(rows.len(), 1);
    // The non-boot incident never enters the first-incident union but still
    // counts towards the total
    assert_eq!(rows[0].incident_count, 3);
    // First incident is the oldest one: the build incident
    assert_eq!(rows[0].build_id.as_deref(), Some("b-c"));
}

#[test]
fn excluded_comment_marker_filters_issue() {
    let conn = schema();
    let ts = ago(1, 0);
    insert_issue(&conn, "issue-m", 1, "detected error_return_code mismatch", ts);
    seed_boot_issue(&conn, "issue-m", "m1", "qemu-arm", ts);
    let db = Db::new(conn);

    let rows = issues::new_issues(&db, &default_opts()).unwrap();
    assert!(rows.is_empty());
}

#[test]
fn foreign_origin_is_ignored() {
    let conn = schema();
    let ts = ago(1, 0);
    conn.execute(
        "INSERT INTO issues VALUES ('issue-f', 1, 'other-ci', 'boot failure', NULL, ?1)",
        params![format_ts(ts)],
    )
    .unwrap();
    let db = Db::new(conn);

    let rows = issues::new_issues(&db, &default_opts()).unwrap();
    assert!(rows.is_empty());
}

#[test]
fn boot_restriction_controls_first_incident_union() {
    let conn = schema();
    let ts = ago(1, 0);
    insert_issue(&conn, "issue-p", 1, "selftest failure", ts);

    insert_checkout(&conn, "c-p", "hash-p", ts);
    insert_build(&conn, "b-p", "c-p", "defconfig", "arm64", "gcc-12", ts);
    insert_test(&conn, "t-p", "b-p", "kselftest.timers", "FAIL", "qemu-arm", ts);
    insert_incident(&conn, "i-p", "issue-p", 1, None, Some("t-p"), ts);
    let db = Db::new(conn);

    // Restricted: the issue is still new, but no first-incident row matches
    let restricted = issues::new_issues(&db, &default_opts()).unwrap();
    assert_eq!(restricted.len(), 1);
    assert!(restricted[0].test_id.is_none());
    assert_eq!(restricted[0].incident_count, 1);

    // Unrestricted: the non-boot test incident provides the checkout fields
    let mut opts = default_opts();
    opts.boot_paths_only = false;
    let unrestricted = issues::new_issues(&db, &opts).unwrap();
    assert_eq!(unrestricted.len(), 1);
    assert_eq!(unrestricted[0].test_id.as_deref(), Some("t-p"));
    assert_eq!(unrestricted[0].git_commit_hash.as_deref(), Some("hash-p"));
}

#[test]
fn new_issues_are_sorted_newest_first_and_unique() {
    let conn = schema();
    insert_issue(&conn, "issue-1", 1, "first", ago(2, 0));
    insert_issue(&conn, "issue-2", 1, "second", ago(1, 0));
    seed_boot_issue(&conn, "issue-1", "s1", "qemu-arm", ago(2, 0));
    seed_boot_issue(&conn, "issue-2", "s2", "qemu-arm", ago(1, 0));
    // A second incident for issue-2 must not duplicate its row
    seed_boot_issue(&conn, "issue-2", "s3", "qemu-x86", ago(0, 12));
    let db = Db::new(conn);

    let rows = issues::new_issues(&db, &default_opts()).unwrap();
    let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["issue-2", "issue-1"]);
    assert_eq!(rows[0].incident_count, 2);
}

#[test]
fn issue_details_ignores_window_and_path_restriction() {
    let conn = schema();
    // Way outside any detection window
    insert_issue(&conn, "issue-d", 1, "ancient failure", ago(30, 0));
    insert_issue(&conn, "issue-d", 2, "ancient failure, updated", ago(29, 0));

    insert_checkout(&conn, "c-d", "hash-d", ago(30, 0));
    insert_build(&conn, "b-d", "c-d", "defconfig", "riscv", "clang-17", ago(30, 0));
    insert_test(&conn, "t-d", "b-d", "kselftest.net", "FAIL", "qemu-riscv", ago(30, 0));
    insert_incident(&conn, "i-d", "issue-d", 1, None, Some("t-d"), ago(30, 0));
    let db = Db::new(conn);

    let details = issues::issue_details(&db, "issue-d").unwrap().unwrap();
    assert_eq!(details.version, 2);
    assert_eq!(details.incident_count, 1);
    assert_eq!(details.test_id.as_deref(), Some("t-d"));
    assert_eq!(details.git_commit_hash.as_deref(), Some("hash-d"));

    assert!(issues::issue_details(&db, "no-such-issue").unwrap().is_none());
}

#[test]
fn build_incidents_deduplicate_by_config_arch_compiler() {
    let conn = schema();
    let ts = ago(1, 0);
    insert_issue(&conn, "issue-b", 1, "build failure", ts);
    insert_checkout(&conn, "c-b", "hash-b", ts);

    // Same triple twice (older and newer), plus one distinct triple
    insert_build(&conn, "b-old", "c-b", "defconfig", "arm64", "gcc-12", ago(2, 0));
    insert_build(&conn, "b-new", "c-b", "defconfig", "arm64", "gcc-12", ago(1, 0));
    insert_build(&conn, "b-x86", "c-b", "defconfig", "x86_64", "gcc-12", ago(1, 0));
    insert_incident(&conn, "i-b1", "issue-b", 1, Some("b-old"), None, ago(2, 0));
    insert_incident(&conn, "i-b2", "issue-b", 1, Some("b-new"), None, ago(1, 0));
    insert_incident(&conn, "i-b3", "issue-b", 1, Some("b-x86"), None, ago(1, 0));
    let db = Db::new(conn);

    let builds = issues::build_incidents(&db, "issue-b").unwrap();
    assert_eq!(builds.len(), 2);

    let triples: Vec<_> = builds
        .iter()
        .map(|b| (b.config_name.clone(), b.architecture.clone(), b.compiler.clone()))
        .collect();
    let mut deduped = triples.clone();
    deduped.dedup();
    assert_eq!(triples, deduped);

    // The arm64 representative is the newest build of its group
    let arm = builds
        .iter()
        .find(|b| b.architecture.as_deref() == Some("arm64"))
        .unwrap();
    assert_eq!(arm.build_id, "b-new");
}

#[test]
fn test_incidents_emit_one_row_per_platform() {
    let conn = schema();
    let ts = ago(1, 0);
    insert_issue(&conn, "issue-t", 1, "boot failure", ts);
    insert_checkout(&conn, "c-t", "hash-t", ts);
    insert_build(&conn, "b-t", "c-t", "defconfig", "arm64", "gcc-12", ts);

    // Two qemu-arm incidents (t-2d and t-1d), one qemu-x86, one non-boot
    insert_test(&conn, "t-arm-old", "b-t", "boot", "FAIL", "qemu-arm", ago(2, 0));
    insert_test(&conn, "t-arm-new", "b-t", "boot", "FAIL", "qemu-arm", ago(1, 0));
    insert_test(&conn, "t-x86", "b-t", "boot.nfs", "FAIL", "qemu-x86", ago(1, 0));
    insert_test(&conn, "t-skip", "b-t", "kselftest.timers", "FAIL", "qemu-arm", ago(1, 0));
    insert_incident(&conn, "i-t1", "issue-t", 1, None, Some("t-arm-old"), ago(2, 0));
    insert_incident(&conn, "i-t2", "issue-t", 1, None, Some("t-arm-new"), ago(1, 0));
    insert_incident(&conn, "i-t3", "issue-t", 1, None, Some("t-x86"), ago(1, 0));
    insert_incident(&conn, "i-t4", "issue-t", 1, None, Some("t-skip"), ago(1, 0));
    let db = Db::new(conn);

    let incidents = issues::test_incidents(&db, "issue-t").unwrap();
    assert_eq!(incidents.len(), 2);

    let arm = incidents
        .iter()
        .find(|i| i.platform.as_deref() == Some("qemu-arm"))
        .unwrap();
    // Representative row is the most recent incident, annotated with the
    // platform's oldest timestamp and total count
    assert_eq!(arm.test_id, "t-arm-new");
    assert_eq!(arm.platform_count, 2);
    assert!(arm.oldest_timestamp < arm.timestamp);

    let x86 = incidents
        .iter()
        .find(|i| i.platform.as_deref() == Some("qemu-x86"))
        .unwrap();
    assert_eq!(x86.platform_count, 1);
    assert_eq!(x86.oldest_timestamp, x86.timestamp);
}

/// Fixture for the last-known-good searches: issue-g regressed on qemu-arm
/// boot two days ago; passing runs exist before and after.
fn seed_lkg_fixture(conn: &Connection) {
    insert_issue(conn, "issue-g", 1, "boot failure", ago(2, 0));

    // Failing run that the issue tracks
    insert_checkout(conn, "c-bad", "hash-bad", ago(2, 0));
    insert_build(conn, "b-bad", "c-bad", "defconfig", "arm64", "gcc-12", ago(2, 0));
    insert_test(conn, "t-bad", "b-bad", "boot", "FAIL", "qemu-arm", ago(2, 0));
    insert_incident(conn, "i-g", "issue-g", 1, None, Some("t-bad"), ago(2, 0));

    // Passing run on the bad commit (same checkout lineage)
    insert_build(conn, "b-bad2", "c-bad", "defconfig", "arm64", "gcc-12", ago(3, 0));
    insert_test(conn, "t-pass-bad", "b-bad2", "boot", "PASS", "qemu-arm", ago(3, 0));

    // Clean passing run, older still
    insert_checkout(conn, "c-good", "hash-good", ago(4, 0));
    insert_build(conn, "b-good", "c-good", "defconfig", "arm64", "gcc-12", ago(4, 0));
    insert_test(conn, "t-pass-good", "b-good", "boot", "PASS", "qemu-arm", ago(4, 0));

    // Passing run after the regression window opened; must never win
    insert_checkout(conn, "c-late", "hash-late", ago(1, 0));
    insert_build(conn, "b-late", "c-late", "defconfig", "arm64", "gcc-12", ago(1, 0));
    insert_test(conn, "t-pass-late", "b-late", "boot", "PASS", "qemu-arm", ago(1, 0));
}

#[test]
fn last_known_good_picks_newest_pass_before_regression() {
    let conn = schema();
    seed_lkg_fixture(&conn);
    let db = Db::new(conn);

    let issue = issues::issue_details(&db, "issue-g").unwrap().unwrap();
    let incidents = issues::test_incidents(&db, "issue-g").unwrap();
    assert_eq!(incidents.len(), 1);

    let good = issues::last_known_good(&db, ORIGIN, &issue, &incidents[0])
        .unwrap()
        .unwrap();
    // Most recent PASS strictly before the oldest incident: the run on the
    // bad commit three days ago (the simple variant allows any commit)
    assert_eq!(good.test_id, "t-pass-bad");
    assert_eq!(good.git_commit_hash.as_deref(), Some("hash-bad"));
}

#[test]
fn strict_last_known_good_never_returns_issue_commits() {
    let conn = schema();
    seed_lkg_fixture(&conn);
    let db = Db::new(conn);

    let issue = issues::issue_details(&db, "issue-g").unwrap().unwrap();
    let incidents = issues::test_incidents(&db, "issue-g").unwrap();

    let good = issues::last_known_good_strict(&db, ORIGIN, &issue, &incidents[0], 18)
        .unwrap()
        .unwrap();
    // hash-bad belongs to an incident checkout, so the clean commit wins
    assert_eq!(good.test_id, "t-pass-good");
    assert_eq!(good.git_commit_hash.as_deref(), Some("hash-good"));
}

#[test]
fn strict_last_known_good_respects_lookback_bound() {
    let conn = schema();
    seed_lkg_fixture(&conn);
    // Push the only clean pass outside a 3-day lookback
    conn.execute("DELETE FROM tests WHERE id = 't-pass-good'", [])
        .unwrap();
    insert_test(&conn, "t-pass-good", "b-good", "boot", "PASS", "qemu-arm", ago(20, 0));
    let db = Db::new(conn);

    let issue = issues::issue_details(&db, "issue-g").unwrap().unwrap();
    let incidents = issues::test_incidents(&db, "issue-g").unwrap();

    let good = issues::last_known_good_strict(&db, ORIGIN, &issue, &incidents[0], 18).unwrap();
    assert!(good.is_none());
}

#[test]
fn last_known_good_ignores_other_branches() {
    let conn = schema();
    seed_lkg_fixture(&conn);
    // Retarget the clean pass at another branch
    conn.execute(
        "UPDATE checkouts SET git_repository_branch = 'linux-6.6.y' WHERE id = 'c-good'",
        [],
    )
    .unwrap();
    // And drop the pass on the bad commit so nothing else qualifies
    conn.execute("DELETE FROM tests WHERE id = 't-pass-bad'", [])
        .unwrap();
    let db = Db::new(conn);

    let issue = issues::issue_details(&db, "issue-g").unwrap().unwrap();
    let incidents = issues::test_incidents(&db, "issue-g").unwrap();

    let simple = issues::last_known_good(&db, ORIGIN, &issue, &incidents[0]).unwrap();
    assert!(simple.is_none());
}

#[test]
fn empty_store_yields_empty_results() {
    let db = Db::new(schema());

    assert!(issues::new_issues(&db, &default_opts()).unwrap().is_empty());
    assert!(issues::issue_details(&db, "nothing").unwrap().is_none());
    assert!(issues::build_incidents(&db, "nothing").unwrap().is_empty());
    assert!(issues::test_incidents(&db, "nothing").unwrap().is_empty());
    assert!(
        issues::tests_results(&db, ORIGIN, GITURL, BRANCH, "boot%", 18)
            .unwrap()
            .is_empty()
    );
}

#[test]
fn tests_results_caps_runs_per_path() {
    let conn = schema();
    insert_checkout(&conn, "c-h", "hash-h", ago(1, 0));
    insert_build(&conn, "b-h", "c-h", "defconfig", "arm64", "gcc-12", ago(1, 0));

    for i in 0..12 {
        insert_test(
            &conn,
            &format!("t-h{i}"),
            "b-h",
            "boot",
            if i % 2 == 0 { "PASS" } else { "FAIL" },
            "qemu-arm",
            ago(0, i),
        );
    }
    insert_test(&conn, "t-nfs", "b-h", "boot.nfs", "PASS", "qemu-arm", ago(0, 1));
    let db = Db::new(conn);

    let results = issues::tests_results(&db, ORIGIN, GITURL, BRANCH, "boot%", 18).unwrap();
    let boot_runs: Vec<_> = results.iter().filter(|r| r.path == "boot").collect();
    let nfs_runs: Vec<_> = results.iter().filter(|r| r.path == "boot.nfs").collect();
    assert_eq!(boot_runs.len(), 10);
    assert_eq!(nfs_runs.len(), 1);

    // Newest first within a path
    assert_eq!(boot_runs[0].test_id, "t-h0");
}
