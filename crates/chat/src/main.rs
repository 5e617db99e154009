use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ragline::chat::{Conversation, ExchangeError, ExchangeOutcome, StreamingExchange};
use ragline::sessions::{SessionListSynchronizer, SyncError};
use ragline::settings::{SettingsError, SettingsStore};
use ragline_api::{
    ApiError, HttpBackend, KnowledgeId, MessageRole, NewSession, SessionApi, SessionId,
    SessionPatch,
};
use snafu::{ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ragline", about = "Streaming client for a retrieval-augmented chat backend")]
struct Cli {
    /// Overrides the configured backend base URL.
    #[arg(long, global = true)]
    base_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Exchanges account credentials for a token and stores it in the settings file.
    Login {
        #[arg(long)]
        username: String,
        #[arg(long, env = "RAGLINE_PASSWORD", hide_env_values = true)]
        password: String,
    },
    #[command(subcommand)]
    Sessions(SessionsCommand),
    /// Prints a session's persisted messages.
    History { session_id: SessionId },
    /// Asks a question and streams the answer. Ctrl-C stops it.
    Ask {
        session_id: SessionId,
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum SessionsCommand {
    List,
    Create {
        #[arg(long)]
        knowledge_id: i64,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        icon: Option<String>,
    },
    Rename {
        session_id: SessionId,
        title: String,
    },
    Delete {
        session_id: SessionId,
    },
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("{source}"))]
    Api { source: ApiError },
    #[snafu(display("{source}"))]
    Sync { source: SyncError },
    #[snafu(display("{source}"))]
    Exchange { source: ExchangeError },
    #[snafu(display("{source}"))]
    Settings { source: SettingsError },
    #[snafu(display("{message}"))]
    TurnFailed { message: String },
}

struct App {
    settings: SettingsStore,
    backend: Arc<HttpBackend>,
    sessions: SessionListSynchronizer,
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "command failed");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let app = App::load(cli.base_url)?;

    let result = match cli.command {
        Command::Login { username, password } => app.login(&username, &password).await,
        Command::Sessions(command) => app.sessions(command).await,
        Command::History { session_id } => app.history(session_id).await,
        Command::Ask {
            session_id,
            question,
        } => app.ask(session_id, &question.join(" ")).await,
    };

    // A 401 anywhere above logged the client out.
    if let Err(error) = app.settings.forget_rejected_token(app.backend.auth()) {
        tracing::warn!(error = %error, "failed to remove rejected token");
    }
    result
}

impl App {
    fn load(base_url: Option<String>) -> Result<Self, CliError> {
        let settings = SettingsStore::load();
        let mut current = (*settings.settings()).clone();
        if let Some(base_url) = base_url {
            current.base_url = base_url;
            current = current.normalized();
        }

        let backend = Arc::new(
            HttpBackend::new(current.backend_config(), current.auth_state()).context(ApiSnafu)?,
        );
        let sessions = SessionListSynchronizer::new(backend.clone());

        Ok(Self {
            settings,
            backend,
            sessions,
        })
    }

    async fn login(&self, username: &str, password: &str) -> Result<(), CliError> {
        self.backend
            .login(username, password)
            .await
            .context(ApiSnafu)?;

        let token = self
            .backend
            .auth()
            .bearer_token()
            .map(|token| token.as_str().to_string());
        self.settings
            .update(|settings| settings.token = token)
            .context(SettingsSnafu)?;

        println!(
            "signed in; token stored in {}",
            self.settings.config_path().display()
        );
        Ok(())
    }

    async fn sessions(&self, command: SessionsCommand) -> Result<(), CliError> {
        match command {
            SessionsCommand::List => {
                let sessions = self.sessions.list().await.context(SyncSnafu)?;
                for session in sessions {
                    println!(
                        "{}  {}  {}",
                        session.id,
                        session.updated_at.format("%Y-%m-%d %H:%M"),
                        session.title
                    );
                }
            }
            SessionsCommand::Create {
                knowledge_id,
                title,
                icon,
            } => {
                let mut input = NewSession::new(KnowledgeId::new(knowledge_id));
                if let Some(title) = title {
                    input = input.with_title(title);
                }
                if let Some(icon) = icon {
                    input = input.with_icon(icon);
                }
                let created = self.sessions.create(input).await.context(SyncSnafu)?;
                println!("{}  {}", created.id, created.title);
            }
            SessionsCommand::Rename { session_id, title } => {
                let updated = self
                    .sessions
                    .patch(session_id, SessionPatch::title(title))
                    .await
                    .context(SyncSnafu)?;
                println!("{}  {}", updated.id, updated.title);
            }
            SessionsCommand::Delete { session_id } => {
                self.sessions.remove(session_id).await.context(SyncSnafu)?;
                println!("deleted {session_id}");
            }
        }

        Ok(())
    }

    async fn load_conversation(&self, session_id: SessionId) -> Result<Conversation, CliError> {
        let session = self.sessions.refresh(session_id).await.context(SyncSnafu)?;
        let history = self
            .backend
            .list_messages(session_id)
            .await
            .context(ApiSnafu)?;

        let mut conversation = Conversation::from_session(&session);
        // A freshly built conversation has no running turn.
        if let Err(rejection) = conversation.hydrate(history) {
            tracing::warn!(rejection = %rejection, "history not loaded");
        }
        Ok(conversation)
    }

    async fn history(&self, session_id: SessionId) -> Result<(), CliError> {
        let conversation = self.load_conversation(session_id).await?;

        println!("# {}", conversation.title);
        for record in &conversation.records {
            let speaker = match record.role {
                MessageRole::User => "you",
                MessageRole::Assistant => "assistant",
            };
            println!("\n[{speaker}] {}", record.content);
            print_citations(record.citations.as_deref().unwrap_or_default());
        }
        Ok(())
    }

    async fn ask(&self, session_id: SessionId, question: &str) -> Result<(), CliError> {
        let mut conversation = self.load_conversation(session_id).await?;
        let exchange = StreamingExchange::new(self.backend.clone(), self.sessions.clone())
            .with_options(self.settings.settings().exchange_options());

        let handle = exchange
            .start(&mut conversation, question)
            .context(ExchangeSnafu)?;
        let stop = handle.stream.stop_handle();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.stop();
            }
        });

        let mut printed = 0usize;
        let mut stdout = std::io::stdout();
        let outcome = exchange
            .drive(&mut conversation, handle, |conversation| {
                let Some(answer) = conversation
                    .records
                    .last()
                    .filter(|record| record.role == MessageRole::Assistant)
                else {
                    return;
                };
                if let Some(fresh) = answer.content.get(printed..) {
                    let _ = write!(stdout, "{fresh}");
                    let _ = stdout.flush();
                    printed = answer.content.len();
                }
            })
            .await
            .context(ExchangeSnafu)?;
        ctrl_c.abort();
        println!();

        match outcome {
            ExchangeOutcome::Completed(_) => {
                if let Some(answer) = conversation.last_answer() {
                    print_citations(answer.citations.as_deref().unwrap_or_default());
                    if let Some(tokens) = answer.usage_tokens {
                        println!("\n({tokens} tokens)");
                    }
                }
                Ok(())
            }
            ExchangeOutcome::Cancelled(_) => {
                println!("(stopped)");
                Ok(())
            }
            ExchangeOutcome::Failed { failure, .. } => {
                if failure.is_quota_exceeded() {
                    eprintln!("quota exhausted; try again later");
                }
                TurnFailedSnafu {
                    message: failure.message,
                }
                .fail()
            }
        }
    }
}

fn print_citations(citations: &[ragline_protocol::Citation]) {
    if citations.is_empty() {
        return;
    }

    println!("\nsources:");
    for (index, citation) in citations.iter().enumerate() {
        let page = citation
            .page
            .map(|page| format!(" p.{page}"))
            .unwrap_or_default();
        let score = citation
            .score
            .map(|score| format!(" ({score:.2})"))
            .unwrap_or_default();
        println!("  [{}] {}{page}{score}", index + 1, citation.filename);
    }
}
