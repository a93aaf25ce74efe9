//! Nimbus - Back up a cloud mailbox to a local folder
//!
//! Authorizes against the provider in the browser, then downloads every
//! message not yet present in the target folder as an `.eml` file.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use log::{error, info, warn};
use mailsync::{
    BackupConfig, BackupFile, BackupSummary, EventSink, LoopbackConsent, MessageId, OAuthCredentials,
    Provider, SyncEngine,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "nimbus", version, about = "Back up a cloud mailbox to a local folder")]
#[command(after_help = "Examples:\n  \
    nimbus --id client_id --secret client_secret -p ./backup -f \"parentFolderId eq 'Inbox'\" -s 2023/09/01 -e 2023/09/15 -c 5 -d\n  \
    nimbus --provider gmail -p ./backup -f in:sent")]
struct Args {
    /// OAuth client id of the registered application
    #[arg(long)]
    id: Option<String>,

    /// OAuth client secret of the registered application
    #[arg(long)]
    secret: Option<String>,

    /// Directory to save messages to
    #[arg(short = 'p', long = "path")]
    path: PathBuf,

    /// Filter applied when retrieving messages, in the provider's query syntax
    #[arg(short = 'f', long)]
    filter: Option<String>,

    /// Only messages received on or after this date (YYYY/MM/DD)
    #[arg(short = 's', long = "start", value_parser = mailsync::parse_date)]
    start: Option<NaiveDate>,

    /// Only messages received on or before this date (YYYY/MM/DD)
    #[arg(short = 'e', long = "end", value_parser = mailsync::parse_date)]
    end: Option<NaiveDate>,

    /// Number of simultaneous connections used
    #[arg(short = 'c', long = "connections", default_value_t = 5)]
    connections: usize,

    /// Delete local messages that no longer exist remotely
    #[arg(short = 'd', long = "sync-deletes")]
    sync_deletes: bool,

    /// Mail service to back up (office365 or gmail)
    #[arg(long, default_value = "office365", value_parser = Provider::from_str)]
    provider: Provider,

    /// JSON file holding the OAuth client id and secret
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Print the authorization URL instead of opening a browser
    #[arg(long)]
    no_browser: bool,
}

/// Prints engine notifications to the console
struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn on_before_backup(&self, _id: &MessageId, path: &Path, will_skip: bool) {
        if will_skip {
            println!("Message exists locally, skipping: {}", path.display());
        }
    }

    fn on_after_backup(&self, _file: &BackupFile, progress: usize, total: usize) {
        println!("Message backed up successfully. Progress: {}/{}", progress, total);
    }

    fn on_message_error(&self, _id: &MessageId, code: &str, message: &str, will_retry: bool) {
        let action = if will_retry { "retrying" } else { "skipping" };
        println!("Error backing up message, {}: {}: {}", action, code, message);
    }

    fn on_message_delete(&self, _id: &MessageId, path: &Path) {
        println!("Message not present remotely, deleting local file: {}", path.display());
    }

    fn on_end_backup(&self, summary: &BackupSummary) {
        println!("Backup Completed");
        println!("Messages backed up: {}", summary.backed_up);
        println!("Messages skipped: {}", summary.skipped);
        if summary.failed > 0 {
            println!("Messages failed: {}", summary.failed);
        }
        if summary.sync_deletes {
            println!("Messages deleted: {}", summary.deleted);
            if summary.delete_failures > 0 {
                println!("Messages that could not be deleted: {}", summary.delete_failures);
            }
        }
    }
}

/// Resolve client credentials; command-line values win over stored ones
fn resolve_credentials(args: &Args) -> Result<OAuthCredentials> {
    if let (Some(id), Some(secret)) = (&args.id, &args.secret) {
        return Ok(OAuthCredentials {
            client_id: id.clone(),
            client_secret: secret.clone(),
        });
    }

    let stored = match &args.credentials {
        Some(path) => OAuthCredentials::from_file(path)?,
        None => {
            if !OAuthCredentials::is_available() {
                print_setup_hint();
            }
            OAuthCredentials::load()?
        }
    };

    Ok(OAuthCredentials {
        client_id: args.id.clone().unwrap_or(stored.client_id),
        client_secret: args.secret.clone().unwrap_or(stored.client_secret),
    })
}

fn print_setup_hint() {
    let path = OAuthCredentials::default_credentials_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<config dir>/credentials.json".to_string());
    warn!(
        "To configure access, either:\n\
         1. Pass --id and --secret\n\
         2. Place your OAuth client credentials at: {}\n\
         3. Or set environment variables: NIMBUS_CLIENT_ID and NIMBUS_CLIENT_SECRET",
        path
    );
}

fn run(args: Args) -> Result<BackupSummary> {
    let credentials = resolve_credentials(&args).context("OAuth client credentials not found")?;

    let config = BackupConfig {
        provider: args.provider,
        data_folder: args.path,
        filter: args.filter,
        start_date: args.start,
        end_date: args.end,
        max_connections: args.connections,
        sync_deletes: args.sync_deletes,
        ..Default::default()
    }
    .with_credentials(credentials);

    let consent = if args.no_browser {
        LoopbackConsent::new().without_browser()
    } else {
        LoopbackConsent::new()
    };

    let engine = SyncEngine::from_config(&config, Box::new(consent))?.with_sink(Arc::new(ConsoleSink));

    info!(
        "Backing up {} mailbox to {}",
        config.provider,
        config.data_folder.display()
    );
    let summary = engine.run()?;
    Ok(summary)
}

fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();

    // Bootstrap config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    match run(args) {
        Ok(summary) if summary.failed > 0 => {
            warn!("{} messages could not be backed up", summary.failed);
            ExitCode::from(2)
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Error encountered: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_full_command_line() {
        let args = Args::try_parse_from([
            "nimbus", "--id", "client", "--secret", "s3cret", "-p", "../test_folder", "-f",
            "parentFolderId eq 'Inbox'", "-s", "2023/09/01", "-e", "2023-09-15", "-c", "3", "-d",
        ])
        .unwrap();

        assert_eq!(args.path, PathBuf::from("../test_folder"));
        assert_eq!(args.filter.as_deref(), Some("parentFolderId eq 'Inbox'"));
        assert_eq!(args.start, NaiveDate::from_ymd_opt(2023, 9, 1));
        assert_eq!(args.end, NaiveDate::from_ymd_opt(2023, 9, 15));
        assert_eq!(args.connections, 3);
        assert!(args.sync_deletes);
        assert_eq!(args.provider, Provider::Office365);
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["nimbus", "-p", "out", "--provider", "gmail"]).unwrap();
        assert_eq!(args.connections, 5);
        assert!(!args.sync_deletes);
        assert_eq!(args.provider, Provider::Gmail);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Args::try_parse_from(["nimbus"]).is_err());
        assert!(Args::try_parse_from(["nimbus", "-p", "out", "-s", "September 1"]).is_err());
        assert!(Args::try_parse_from(["nimbus", "-p", "out", "--provider", "imap"]).is_err());
    }

    #[test]
    fn test_flag_credentials_win() {
        let args =
            Args::try_parse_from(["nimbus", "-p", "out", "--id", "a", "--secret", "b"]).unwrap();
        let creds = resolve_credentials(&args).unwrap();
        assert_eq!(creds.client_id, "a");
        assert_eq!(creds.client_secret, "b");
    }
}
