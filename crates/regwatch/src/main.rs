//! Regwatch - KernelCI regression watcher
//!
//! Queries the results database for newly detected issues, correlates them
//! with build/test history, and prints or mails plain-text reports.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "regwatch")]
#[command(about = "KernelCI regression watcher and report mailer", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect new issues and compose one report per issue
    Report {
        /// Actually send reports (default is print-only)
        #[arg(long)]
        send: bool,

        /// Send without asking for confirmation
        #[arg(long)]
        yes: bool,

        /// To address (overrides mail.default_to)
        #[arg(long)]
        to: Option<String>,

        /// Extra Cc address
        #[arg(long)]
        cc: Option<String>,

        /// Drop per-report recipients, Cc only what was passed explicitly
        #[arg(long)]
        ignore_recipients: bool,

        /// Override the detection window length
        #[arg(long)]
        window_days: Option<i64>,

        /// Consider all test paths, not just boot/boot.nfs
        #[arg(long)]
        all_paths: bool,
    },

    /// Show details, incidents, and regression windows for one issue
    Issue {
        /// Issue id
        id: String,
    },

    /// Recent boot test history on a tree/branch
    History {
        #[arg(long)]
        giturl: String,

        #[arg(long)]
        branch: String,

        /// Override the origin tag
        #[arg(long)]
        origin: Option<String>,

        /// Test path pattern (SQL LIKE)
        #[arg(long, default_value = "boot%")]
        path: String,
    },

    /// Fetch a document from the dashboard API
    Show {
        #[command(subcommand)]
        what: commands::ShowCommands,
    },

    /// Result summary for a tree at a commit
    Summary {
        #[arg(long)]
        giturl: String,

        #[arg(long)]
        branch: String,

        #[arg(long)]
        commit: String,

        /// Commit timestamp (RFC 3339); recent commits bypass the cache
        #[arg(long)]
        timestamp: String,

        /// Override the origin tag
        #[arg(long)]
        origin: Option<String>,

        /// Also fetch the commit history
        #[arg(long)]
        commits: bool,

        /// Fetch full results instead of the summary
        #[arg(long)]
        full: bool,
    },

    /// List trees known to the dashboard (always fetched fresh)
    Trees {
        /// Override the origin tag
        #[arg(long)]
        origin: Option<String>,
    },

    /// Show or update configuration
    Config {
        /// Set a configuration value (section.key=value)
        #[arg(long)]
        set: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Report {
            send,
            yes,
            to,
            cc,
            ignore_recipients,
            window_days,
            all_paths,
        } => commands::report(send, yes, to, cc, ignore_recipients, window_days, all_paths),
        Commands::Issue { id } => commands::issue(&id),
        Commands::History {
            giturl,
            branch,
            origin,
            path,
        } => commands::history(&giturl, &branch, origin.as_deref(), &path),
        Commands::Show { what } => commands::show(what),
        Commands::Summary {
            giturl,
            branch,
            commit,
            timestamp,
            origin,
            commits,
            full,
        } => commands::summary(
            &giturl,
            &branch,
            &commit,
            &timestamp,
            origin.as_deref(),
            commits,
            full,
        ),
        Commands::Trees { origin } => commands::trees(origin.as_deref()),
        Commands::Config { set } => commands::config(set.as_deref()),
    }
}
