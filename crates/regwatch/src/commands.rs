//! Command implementations for the regwatch CLI

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use std::path::Path;
use tracing::info;

use regwatch_common::config::RegwatchConfig;
use regwatch_common::dashboard::DashboardClient;
use regwatch_common::db::Db;
use regwatch_common::issues::{self, IssueQueryOptions};
use regwatch_common::mail::{self, GmailClient, MailOptions, SendMode};
use regwatch_common::report::{self, IssueReportData};

/// Dashboard document lookups
#[derive(Subcommand)]
pub enum ShowCommands {
    /// A single test execution
    Test {
        id: String,

        /// Bypass the response cache
        #[arg(long)]
        no_cache: bool,
    },

    /// A single build
    Build {
        id: String,

        /// Bypass the response cache
        #[arg(long)]
        no_cache: bool,
    },

    /// A single issue version, optionally with its tests or builds
    Issue {
        id: String,

        #[arg(long)]
        version: i64,

        /// Also fetch tests linked to this issue version
        #[arg(long)]
        tests: bool,

        /// Also fetch builds linked to this issue version
        #[arg(long)]
        builds: bool,
    },
}

fn dashboard_client(config: &RegwatchConfig) -> Result<DashboardClient> {
    DashboardClient::new(&config.dashboard.base_url, Path::new(&config.dashboard.cache_dir))
        .map_err(Into::into)
}

fn print_json(doc: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(doc)?);
    Ok(())
}

/// Collect the correlation data for one issue summary
fn gather_report_data(
    db: &Db,
    config: &RegwatchConfig,
    issue: issues::IssueSummary,
) -> Result<IssueReportData> {
    let builds = issues::build_incidents(db, &issue.id)?;
    let incidents = issues::test_incidents(db, &issue.id)?;

    let mut platforms = Vec::with_capacity(incidents.len());
    for incident in incidents {
        let baseline = issues::last_known_good_strict(
            db,
            &config.query.origin,
            &issue,
            &incident,
            config.query.lookback_days,
        )?;
        platforms.push((incident, baseline));
    }

    Ok(IssueReportData { issue, builds, platforms })
}

pub fn report(
    send: bool,
    yes: bool,
    to: Option<String>,
    cc: Option<String>,
    ignore_recipients: bool,
    window_days: Option<i64>,
    all_paths: bool,
) -> Result<()> {
    let config = RegwatchConfig::load()?;
    let db = Db::open(&config.database)?;

    let mut opts = IssueQueryOptions::from(&config.query);
    if let Some(days) = window_days {
        opts.window_days = days;
    }
    if all_paths {
        opts.boot_paths_only = false;
    }

    let new_issues = issues::new_issues(&db, &opts)?;
    if new_issues.is_empty() {
        println!("No new issues found.");
        return Ok(());
    }
    info!("Found {} new issue(s)", new_issues.len());

    let mode = match (send, yes) {
        (false, _) => SendMode::DryRun,
        (true, false) => SendMode::Confirm,
        (true, true) => SendMode::Force,
    };

    let to = to.unwrap_or_else(|| config.mail.default_to.clone());
    if mode != SendMode::DryRun && to.is_empty() {
        anyhow::bail!("No To address: pass --to or set mail.default_to");
    }

    let client = if mode == SendMode::DryRun {
        None
    } else {
        Some(GmailClient::authorize(Path::new(&config.mail.token_file))?)
    };

    let mail_opts = MailOptions { to, cc, ignore_recipients, mode };

    for issue in new_issues {
        let data = gather_report_data(&db, &config, issue)?;
        let composed = report::compose(&config.dashboard.base_url, &data);
        mail::send_report(client.as_ref(), &config.mail.sender, &composed, "", &mail_opts)?;
    }

    Ok(())
}

pub fn issue(id: &str) -> Result<()> {
    let config = RegwatchConfig::load()?;
    let db = Db::open(&config.database)?;

    let Some(issue) = issues::issue_details(&db, id)? else {
        println!("Issue '{id}' not found.");
        return Ok(());
    };

    println!("Issue:      {}", issue.id);
    println!("Version:    {}", issue.version);
    println!("Detected:   {}", issue.timestamp.to_rfc3339());
    println!(
        "Tree:       {}/{}",
        issue.tree_name.as_deref().unwrap_or("unknown"),
        issue.git_repository_branch.as_deref().unwrap_or("unknown")
    );
    println!(
        "Commit:     {}",
        issue.git_commit_hash.as_deref().unwrap_or("unknown")
    );
    println!("Incidents:  {}", issue.incident_count);
    if let Some(comment) = issue.comment.as_deref() {
        println!("Comment:    {comment}");
    }

    let builds = issues::build_incidents(&db, id)?;
    if !builds.is_empty() {
        println!("\nBuild incidents:");
        for build in &builds {
            println!(
                "  {} / {} / {}  (latest {})",
                build.config_name.as_deref().unwrap_or("unknown"),
                build.architecture.as_deref().unwrap_or("unknown"),
                build.compiler.as_deref().unwrap_or("unknown"),
                build.timestamp.to_rfc3339(),
            );
        }
    }

    let incidents = issues::test_incidents(&db, id)?;
    if !incidents.is_empty() {
        println!("\nPlatform ranking (boot tests):");
        for incident in &incidents {
            println!(
                "  {}: {} incident(s), first {}, last {}",
                incident.platform.as_deref().unwrap_or("unknown"),
                incident.platform_count,
                incident.oldest_timestamp.to_rfc3339(),
                incident.timestamp.to_rfc3339(),
            );

            let simple = issues::last_known_good(&db, &config.query.origin, &issue, incident)?;
            let strict = issues::last_known_good_strict(
                &db,
                &config.query.origin,
                &issue,
                incident,
                config.query.lookback_days,
            )?;
            match simple {
                Some(good) => println!(
                    "    last passing run:  {} at {}",
                    good.git_commit_hash.as_deref().unwrap_or("unknown"),
                    good.timestamp.to_rfc3339()
                ),
                None => println!("    last passing run:  none found"),
            }
            match strict {
                Some(good) => println!(
                    "    last known good:   {} at {}",
                    good.git_commit_hash.as_deref().unwrap_or("unknown"),
                    good.timestamp.to_rfc3339()
                ),
                None => println!("    last known good:   none found in range"),
            }
        }
    }

    Ok(())
}

pub fn history(giturl: &str, branch: &str, origin: Option<&str>, path: &str) -> Result<()> {
    let config = RegwatchConfig::load()?;
    let db = Db::open(&config.database)?;
    let origin = origin.unwrap_or(&config.query.origin);

    let results =
        issues::tests_results(&db, origin, giturl, branch, path, config.query.lookback_days)?;
    if results.is_empty() {
        println!("No runs found for {giturl} {branch} in the last {} days.", config.query.lookback_days);
        return Ok(());
    }

    let mut current_path = String::new();
    for run in &results {
        if run.path != current_path {
            println!("\n{}:", run.path);
            current_path = run.path.clone();
        }
        println!(
            "  {}  {}  {} / {}  {}",
            run.start_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown time".to_string()),
            run.status.as_deref().unwrap_or("?"),
            run.architecture.as_deref().unwrap_or("unknown"),
            run.compiler.as_deref().unwrap_or("unknown"),
            run.git_commit_name
                .as_deref()
                .or(run.git_commit_hash.as_deref())
                .unwrap_or("unknown"),
        );
    }

    Ok(())
}

pub fn show(what: ShowCommands) -> Result<()> {
    let config = RegwatchConfig::load()?;
    let client = dashboard_client(&config)?;

    match what {
        ShowCommands::Test { id, no_cache } => {
            let doc = if no_cache {
                client.fetch(&format!("test/{id}"), &[], false)?
            } else {
                client.fetch_test(&id)?
            };
            print_json(&doc)
        }
        ShowCommands::Build { id, no_cache } => {
            let doc = if no_cache {
                client.fetch(&format!("build/{id}"), &[], false)?
            } else {
                client.fetch_build(&id)?
            };
            print_json(&doc)
        }
        ShowCommands::Issue { id, version, tests, builds } => {
            print_json(&client.fetch_issue(&id, version)?)?;
            if tests {
                print_json(&client.fetch_issue_tests(&id, version)?)?;
            }
            if builds {
                print_json(&client.fetch_issue_builds(&id, version)?)?;
            }
            Ok(())
        }
    }
}

pub fn summary(
    giturl: &str,
    branch: &str,
    commit: &str,
    timestamp: &str,
    origin: Option<&str>,
    commits: bool,
    full: bool,
) -> Result<()> {
    let config = RegwatchConfig::load()?;
    let client = dashboard_client(&config)?;
    let origin = origin.unwrap_or(&config.query.origin);

    let commit_time: DateTime<Utc> = DateTime::parse_from_rfc3339(timestamp)
        .with_context(|| format!("Invalid commit timestamp '{timestamp}'"))?
        .with_timezone(&Utc);

    let doc = if full {
        client.fetch_full_results(origin, giturl, branch, commit)?
    } else {
        client.fetch_summary(origin, giturl, branch, commit, commit_time)?
    };
    print_json(&doc)?;

    if commits {
        print_json(&client.fetch_commits(origin, giturl, branch, commit)?)?;
    }

    Ok(())
}

pub fn trees(origin: Option<&str>) -> Result<()> {
    let config = RegwatchConfig::load()?;
    let client = dashboard_client(&config)?;
    let origin = origin.unwrap_or(&config.query.origin);

    print_json(&client.fetch_tree_fast(origin)?)
}

pub fn config(set: Option<&str>) -> Result<()> {
    let mut config = RegwatchConfig::load()?;

    match set {
        Some(expr) => {
            config.set(expr)?;
            config.save()?;
            println!("Configuration updated.");
        }
        None => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
