mod config;

use std::io::Write as _;
use std::sync::Arc;

use answer_stream::{AnswerStreams, Ending, StreamEvent};
use anyhow::{bail, Context, Result};
use autosave::{
    BackupStore, DocumentField, DocumentSession, EditableDocument, FileBackupStore, SaveNotice,
    SaveOutcome,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::{Config, TOKEN_VAR};
use notes_sdk::{EnvToken, NotesClient, StaticToken, TokenProvider};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "study-sync", version, about = "Autosaving notes and streamed answers")]
struct Cli {
    /// Notes API base URL. Overrides STUDY_SYNC_API_URL.
    #[arg(long)]
    api_url: Option<String>,

    /// Bearer token. Falls back to STUDY_SYNC_TOKEN, re-read on every request.
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Edit a document from stdin; every line is appended to the body.
    Edit {
        document_id: String,
        #[arg(long, default_value = "Untitled")]
        title: String,
    },
    /// Stream an answer to stdout.
    Ask {
        question: String,
        #[arg(long)]
        question_id: Option<String>,
        #[arg(long, default_value = "cli")]
        block: String,
    },
    /// Inspect local backups.
    Backups {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Debug, Subcommand)]
enum BackupAction {
    List,
    Clear { document_id: String },
    /// Remove backups older than the restore window.
    Prune,
}

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(api_url) = cli.api_url {
        config.api_url = api_url;
    }
    let token: Arc<dyn TokenProvider> = match cli.token {
        Some(token) => Arc::new(StaticToken::new(token)),
        None => Arc::new(EnvToken::new(TOKEN_VAR)),
    };

    match cli.command {
        Command::Edit { document_id, title } => edit(&config, token, document_id, title).await,
        Command::Ask {
            question,
            question_id,
            block,
        } => ask(&config, token, question, question_id, block).await,
        Command::Backups { action } => backups(&config, action),
    }
}

async fn edit(
    config: &Config,
    token: Arc<dyn TokenProvider>,
    document_id: String,
    title: String,
) -> Result<()> {
    let client = NotesClient::new(&config.api_url, token)
        .with_context(|| format!("invalid api url: {}", config.api_url))?;
    let backups = Arc::new(FileBackupStore::new(config.backup_dir()));
    let session = DocumentSession::open(
        EditableDocument::new(&document_id, &title, ""),
        Arc::new(client),
        backups,
        config.autosave(),
    );
    let notices = tokio::spawn(report_notices(session.notices()));

    let mut body = session.snapshot().body;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("reading stdin")? {
                Some(line) => {
                    if !body.is_empty() {
                        body.push('\n');
                    }
                    body.push_str(&line);
                    session.update(DocumentField::Body, body.clone());
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!(document_id = %document_id, "interrupted, flushing");
                break;
            }
        }
    }

    let outcome = session.close().await;
    notices.abort();
    match outcome {
        SaveOutcome::Saved(saved) => {
            eprintln!("saved {} at {}", saved.id, saved.updated_at.to_rfc3339());
            Ok(())
        }
        SaveOutcome::Skipped(_) => Ok(()),
        SaveOutcome::Failed(reason) => {
            bail!("final save failed, edits kept in local backup: {reason}")
        }
        SaveOutcome::RetryScheduled { .. } => bail!("final save did not complete"),
    }
}

async fn report_notices(mut notices: broadcast::Receiver<SaveNotice>) {
    loop {
        match notices.recv().await {
            Ok(SaveNotice::Saved { recovered: true, .. }) => eprintln!("saved after retrying"),
            Ok(SaveNotice::Saved { .. }) => eprintln!("saved"),
            Ok(SaveNotice::Retrying {
                attempt, delay, reason, ..
            }) => eprintln!("save failed ({reason}), retry {attempt} in {}s", delay.as_secs()),
            Ok(SaveNotice::Failed { reason, .. }) => {
                eprintln!("could not save: {reason}. Keep editing or close to try again.")
            }
            Ok(SaveNotice::BackupRestored { saved_at, .. }) => eprintln!(
                "restored unsaved edits from {}",
                saved_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "an unknown time".into())
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "save notices lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn ask(
    config: &Config,
    token: Arc<dyn TokenProvider>,
    question: String,
    question_id: Option<String>,
    block: String,
) -> Result<()> {
    let client = NotesClient::new(&config.api_url, token)
        .with_context(|| format!("invalid api url: {}", config.api_url))?;
    let question_id = question_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let streams = AnswerStreams::new();
    let mut sub = streams
        .ask(&client, &block, &question_id, &question)
        .await
        .context("opening answer stream")?;

    let mut stdout = std::io::stdout();
    while let Some(event) = sub.next_event().await {
        match event {
            StreamEvent::Chunk { text, .. } => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            StreamEvent::Complete { ending, .. } => {
                writeln!(stdout)?;
                if ending == Ending::Recovered {
                    eprintln!("(connection dropped; answer may be incomplete)");
                }
            }
            StreamEvent::Error { kind, message } => {
                bail!("answer stream failed ({kind:?}): {message}")
            }
        }
    }
    streams.stop_all().await;
    Ok(())
}

fn backups(config: &Config, action: BackupAction) -> Result<()> {
    let store = FileBackupStore::new(config.backup_dir());
    match action {
        BackupAction::List => {
            let mut records = store.list().context("listing backups")?;
            records.sort_by_key(|record| std::cmp::Reverse(record.timestamp));
            let now = Utc::now();
            for record in records {
                let fresh = record.is_fresh(now, config.autosave().backup_max_age);
                println!(
                    "{}\t{}\t{}\t{}",
                    record.document_id,
                    record
                        .saved_at()
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_default(),
                    if fresh { "restorable" } else { "stale" },
                    record.title
                );
            }
        }
        BackupAction::Clear { document_id } => {
            store.remove(&document_id).context("removing backup")?;
            println!("cleared backup for {document_id}");
        }
        BackupAction::Prune => {
            let removed = store
                .prune_stale(Utc::now(), config.autosave().backup_max_age)
                .context("pruning backups")?;
            println!("removed {removed} stale backup(s)");
        }
    }
    Ok(())
}
