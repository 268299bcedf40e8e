//! Terminal client that streams a PaperPuppy answer to stdout.

mod render;

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use paperpuppy_stream::prelude::*;
use paperpuppy_stream::{DebounceConfig, StoredMessage};

use crate::render::SuffixPrinter;

#[derive(Parser)]
#[command(name = "paperpuppy")]
#[command(about = "Stream answers from a PaperPuppy backend")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message and stream the answer.
    Send(SendArgs),
}

#[derive(Args)]
struct SendArgs {
    /// Session the message belongs to.
    #[arg(long)]
    session: String,

    #[arg(long)]
    deep_thought: bool,

    #[arg(long)]
    internet: bool,

    /// Answer from the knowledge base.
    #[arg(long)]
    knowledge: bool,

    /// Attached file id; repeat for several files.
    #[arg(long = "file-id")]
    file_ids: Vec<String>,

    /// API root, overrides PAPERPUPPY_BASE_URL.
    #[arg(long)]
    base_url: Option<String>,

    /// Bearer token. Without it the token is read from PAPERPUPPY_TOKEN on every request.
    #[arg(long)]
    token: Option<String>,

    /// Base publish delay in milliseconds.
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Fail when no bytes arrive for this many seconds (0 waits forever).
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// JSON file the conversation is loaded from and saved to.
    #[arg(long)]
    history: Option<PathBuf>,

    /// Message text.
    message: String,
}

impl SendArgs {
    fn client_config(&self) -> Result<ClientConfig> {
        let client = match &self.base_url {
            Some(url) => ClientConfig::new(url.clone()),
            None => ClientConfig::from_env()?,
        };
        client.validate()?;
        Ok(client)
    }

    fn stream_config(&self) -> StreamConfig {
        let mut config = StreamConfig::default();
        if let Some(ms) = self.debounce_ms {
            let debounce = DebounceConfig::default().with_base_delay(Duration::from_millis(ms));
            config = config.debounce(debounce);
        }
        if let Some(secs) = self.idle_timeout_secs {
            config = config.idle_timeout((secs > 0).then(|| Duration::from_secs(secs)));
        }
        config
    }

    fn chat_request(&self) -> ChatRequest {
        self.file_ids.iter().fold(
            ChatRequest::new(self.message.clone())
                .deep_thought(self.deep_thought)
                .internet(self.internet)
                .knowledge(self.knowledge),
            |request, id| request.file_id(id.clone()),
        )
    }
}

fn open_store(history: Option<&Path>) -> Result<InMemoryMessageStore> {
    match history {
        Some(path) => InMemoryMessageStore::load_json(path)
            .with_context(|| format!("loading history from {}", path.display())),
        None => Ok(InMemoryMessageStore::new()),
    }
}

async fn send(args: SendArgs) -> Result<()> {
    let client = args.client_config()?;
    let session = SessionId::from(args.session.clone());
    let store = Arc::new(open_store(args.history.as_deref())?);
    store.add_message(StoredMessage::user(session.clone(), args.message.clone()));

    let credentials: Arc<dyn CredentialProvider> = match &args.token {
        Some(token) => Arc::new(StaticToken::new(token.clone())),
        None => Arc::new(EnvToken::new(client.token_env.clone())),
    };
    let controller = StreamController::builder()
        .transport(Arc::new(HttpTransport::new(&client)?))
        .credentials(credentials)
        .store(store.clone())
        .config(args.stream_config())
        .default_session(session.clone())
        .build()?;

    let endpoint = client.send_url(&session);
    info!(%endpoint, session = %session, "sending message");

    let mut content = controller.subscribe_content();
    let mut printer = SuffixPrinter::default();
    let mut stdout = std::io::stdout();
    let start = controller.start(endpoint, args.chat_request().into_payload(), StartOptions::new());
    tokio::pin!(start);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    let result = loop {
        tokio::select! {
            result = &mut start => break result,
            changed = content.changed() => {
                if changed.is_ok() {
                    let text = content.borrow_and_update().clone();
                    write!(stdout, "{}", printer.advance(&text))?;
                    stdout.flush()?;
                }
            }
            _ = &mut ctrl_c, if !interrupted => {
                warn!("interrupted, cancelling stream");
                interrupted = true;
                controller.cancel();
            }
        }
    };

    if let Ok(answer) = &result {
        write!(stdout, "{}", printer.advance(answer))?;
    }
    if printer.has_output() {
        writeln!(stdout)?;
    }

    if let Some(path) = &args.history {
        store
            .save_json(path)
            .with_context(|| format!("saving history to {}", path.display()))?;
    }

    let answer = result.context("streaming answer")?;
    info!(len = answer.len(), "answer complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_observability();

    match Cli::parse().command {
        Command::Send(args) => send(args).await,
    }
}
