//! Report Mail Delivery
//!
//! Sends composed reports as plain-text email through the Gmail REST API
//! using a persisted OAuth token. The interactive consent flow is out of
//! scope: the operator provisions `token.json` once (see the configured
//! credentials file); this module only loads it and refreshes expired
//! access tokens.
//!
//! Delivery runs in one of three modes: print only (dry run), print then
//! ask for confirmation, or send unconditionally. A failed send is logged
//! and reported as `None` so one bad report does not abort a batch.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::report::Report;

const GMAIL_SEND_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me/messages/send";

/// How a report leaves the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Print the report, never send
    DryRun,
    /// Print the full message, then ask y/n on stdin before sending
    Confirm,
    /// Send without asking
    Force,
}

/// Delivery options for a batch of reports
#[derive(Debug, Clone)]
pub struct MailOptions {
    pub to: String,
    pub cc: Option<String>,
    /// Drop per-report recipients (CC only what was passed explicitly)
    pub ignore_recipients: bool,
    pub mode: SendMode,
}

/// Persisted OAuth token, in the layout written by the provisioning tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailToken {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expiry: Option<String>,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl GmailToken {
    /// Load a token from disk
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read OAuth token {} (provision it from your OAuth client secrets first)",
                path.display()
            )
        })?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse OAuth token {}", path.display()))
    }

    /// Save the token back to disk (after a refresh)
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write OAuth token {}", path.display()))
    }

    /// Whether the access token has expired (unparseable expiry counts as
    /// expired so a refresh is attempted)
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiry.as_deref() {
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(expiry) => expiry.with_timezone(&Utc) <= now,
                Err(_) => true,
            },
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Gmail API client holding a valid access token
pub struct GmailClient {
    http: reqwest::blocking::Client,
    token: GmailToken,
    token_path: PathBuf,
}

impl GmailClient {
    /// Load the persisted token, refreshing and re-saving it if expired
    pub fn authorize(token_path: &Path) -> Result<Self> {
        let token = GmailToken::load(token_path)?;
        let http = reqwest::blocking::Client::new();

        let mut client = Self {
            http,
            token,
            token_path: token_path.to_path_buf(),
        };

        if client.token.is_expired(Utc::now()) {
            client.refresh()?;
        }

        Ok(client)
    }

    fn refresh(&mut self) -> Result<()> {
        let refresh_token = self
            .token
            .refresh_token
            .as_deref()
            .context("OAuth token expired and no refresh token is available")?;

        info!("Refreshing expired Gmail access token");
        let response = self
            .http
            .post(&self.token.token_uri)
            .form(&[
                ("client_id", self.token.client_id.as_str()),
                ("client_secret", self.token.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .context("Token refresh request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            anyhow::bail!("Token refresh rejected ({status}): {body}");
        }

        let refreshed: RefreshResponse = response
            .json()
            .context("Token refresh returned a non-JSON body")?;

        self.token.token = refreshed.access_token;
        self.token.expiry = refreshed
            .expires_in
            .map(|secs| (Utc::now() + Duration::seconds(secs)).to_rfc3339());
        self.token.save(&self.token_path)?;

        Ok(())
    }

    /// Send a raw (base64url) message; returns the Gmail message id
    pub fn send(&self, raw: &str) -> Result<String> {
        let response = self
            .http
            .post(GMAIL_SEND_URL)
            .bearer_auth(&self.token.token)
            .json(&serde_json::json!({ "raw": raw }))
            .send()
            .context("Gmail send request failed")?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .context("Gmail send returned a non-JSON body")?;

        if !status.is_success() {
            anyhow::bail!("Gmail send rejected ({status}): {body}");
        }

        body.get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .context("Gmail send response has no message id")
    }
}

/// Build an RFC 2822 plain-text message, base64url-encoded for the Gmail
/// `raw` payload
pub fn build_message(sender: &str, to: &str, cc: &str, subject: &str, body: &str) -> String {
    let mut message = String::new();
    if !to.is_empty() {
        message.push_str(&format!("To: {to}\r\n"));
    }
    if !cc.is_empty() {
        message.push_str(&format!("Cc: {cc}\r\n"));
    }
    message.push_str(&format!("From: {sender}\r\n"));
    message.push_str(&format!("Subject: {subject}\r\n"));
    message.push_str("Content-Type: text/plain; charset=\"utf-8\"\r\n");
    message.push_str("MIME-Version: 1.0\r\n");
    message.push_str("\r\n");
    message.push_str(body);

    URL_SAFE.encode(message.as_bytes())
}

fn ask_confirmation() -> Result<bool> {
    let stdin = io::stdin();
    loop {
        print!(">> Do you want to send the email? (y/n): ");
        io::stdout().flush()?;

        let mut line = String::new();
        stdin.lock().read_line(&mut line)?;
        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => println!("Please enter 'y' or 'n'."),
        }
    }
}

/// Deliver one report according to `opts.mode`.
///
/// Returns the Gmail message id, or `None` when the report was only
/// printed, the confirmation was declined, or the send failed (failures
/// are logged, not propagated).
pub fn send_report(
    client: Option<&GmailClient>,
    sender: &str,
    report: &Report,
    recipients: &str,
    opts: &MailOptions,
) -> Result<Option<String>> {
    if opts.mode == SendMode::DryRun {
        println!("\n==============================================");
        println!("new report:\n> {}", report.title);
        println!("{}", report.content);
        return Ok(None);
    }

    let mut cc = if opts.ignore_recipients {
        String::new()
    } else {
        recipients.to_string()
    };
    if let Some(extra) = opts.cc.as_deref() {
        cc = if cc.is_empty() {
            extra.to_string()
        } else {
            format!("{extra}, {cc}")
        };
    }

    if opts.mode == SendMode::Confirm {
        println!("===================");
        println!("Subject: {}", report.title);
        println!("To: {}", opts.to);
        if !cc.is_empty() {
            println!("Cc: {cc}");
        }
        println!("{}", report.content);
        if !ask_confirmation()? {
            info!("Email sending aborted");
            return Ok(None);
        }
    }

    info!("Sending '{}'", report.title);
    let client = client.context("Mail client not initialized")?;
    let raw = build_message(sender, &opts.to, &cc, &report.title, &report.content);

    match client.send(&raw) {
        Ok(message_id) => {
            info!("Message sent successfully, id {message_id}");
            Ok(Some(message_id))
        }
        Err(e) => {
            error!("Failed to send '{}': {e:#}", report.title);
            Ok(None)
        }
    }
}
