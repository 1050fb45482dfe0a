// src/main.rs
// chatline - streaming chat client for OpenAI-style APIs

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{Level, debug, info};
use tracing_subscriber::FmtSubscriber;

use chatline::config::{ChatlineConfig, EnvConfig};
use chatline::conversation::MessageStore;
use chatline::llm::{
    ApiClient, AssistantsClient, FileCollaborator, HttpTransport, LlmHttpClient, OpenAiFiles, RunHandle,
};
use chatline::{
    ChatEvent, ClientSettings, ConversationController, Credentials, FileKvStore, KeyValueStore, Preset,
    PresetStore, StreamHandle,
};

const DEFAULT_CONVERSATION: &str = "default";
const RUN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "chatline")]
#[command(about = "Streaming chat client for OpenAI-style APIs")]
#[command(version)]
struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message and stream the reply (Ctrl-C cancels)
    Chat {
        message: String,

        /// Conversation id (defaults to the preset id, then "default")
        #[arg(short, long)]
        conversation: Option<String>,

        /// Use a saved preset's model, prompt and settings
        #[arg(short, long)]
        preset: Option<String>,

        /// Model override
        #[arg(short, long)]
        model: Option<String>,

        /// Upload a file and attach it to this message
        #[arg(short, long)]
        attach: Option<PathBuf>,

        /// Wait for the whole reply instead of streaming it
        #[arg(long)]
        no_stream: bool,
    },

    /// Print a saved conversation
    History {
        #[arg(default_value = DEFAULT_CONVERSATION)]
        conversation: String,
    },

    /// Delete a saved conversation
    Clear {
        #[arg(default_value = DEFAULT_CONVERSATION)]
        conversation: String,
    },

    /// Manage the stored API key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Manage chat presets
    Preset {
        #[command(subcommand)]
        action: PresetAction,
    },

    /// Upload a file for use with assistants
    Upload { path: PathBuf },

    /// Stream an assistant run on a thread
    Run {
        /// Assistant id
        #[arg(short, long)]
        assistant: String,

        /// Existing thread (a new one is created when omitted)
        #[arg(short, long)]
        thread: Option<String>,

        /// Message to add before starting the run
        message: Option<String>,

        /// Poll the run and print the reply once it completes
        #[arg(long)]
        no_stream: bool,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Save an API key
    Set { key: String },
    /// Show the configured key, masked
    Show,
    /// Remove the stored key
    Clear,
}

#[derive(Subcommand)]
enum PresetAction {
    /// List saved presets
    List,
    Add {
        id: String,

        #[arg(short, long)]
        name: Option<String>,

        #[arg(short, long)]
        model: Option<String>,

        #[arg(short, long)]
        system_prompt: Option<String>,

        #[arg(short, long)]
        temperature: Option<f32>,

        #[arg(long)]
        max_tokens: Option<u32>,
    },
    /// Remove a preset and its conversation
    Remove { id: String },
}

/// Everything a command needs from configuration
struct App {
    settings: ClientSettings,
    kv: Arc<dyn KeyValueStore>,
    credentials: Credentials,
}

impl App {
    async fn load() -> Result<Self> {
        let env = EnvConfig::from_env();
        let settings = ClientSettings::resolve(&ChatlineConfig::load(), &env);
        let kv: Arc<dyn KeyValueStore> = Arc::new(FileKvStore::new(settings.data_dir.clone()));
        let credentials = Credentials::load(&env, kv.as_ref()).await?;
        Ok(Self {
            settings,
            kv,
            credentials,
        })
    }

    fn files(&self, http: LlmHttpClient) -> OpenAiFiles {
        OpenAiFiles::new(ApiClient::new(
            http,
            &self.settings.base_url,
            self.credentials.clone(),
        ))
    }

    fn require_key(&self) -> Result<()> {
        if !self.credentials.is_configured() {
            bail!("no API key configured; set OPENAI_API_KEY or run `chatline key set <key>`");
        }
        Ok(())
    }
}

/// Anything that yields chat events and can be cancelled
#[async_trait]
trait EventSource: Send {
    async fn next_event(&mut self) -> Option<ChatEvent>;
    async fn cancel(&mut self) -> bool;
}

#[async_trait]
impl EventSource for StreamHandle {
    async fn next_event(&mut self) -> Option<ChatEvent> {
        self.next().await
    }

    async fn cancel(&mut self) -> bool {
        StreamHandle::cancel(self).await
    }
}

#[async_trait]
impl EventSource for RunHandle {
    async fn next_event(&mut self) -> Option<ChatEvent> {
        self.next().await
    }

    async fn cancel(&mut self) -> bool {
        RunHandle::cancel(self).await
    }
}

enum Step {
    Interrupt,
    Event(Option<ChatEvent>),
}

/// Write deltas to stdout until the stream ends; the first Ctrl-C cancels
async fn print_stream(source: &mut dyn EventSource) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        let step = tokio::select! {
            _ = &mut ctrl_c, if !interrupted => Step::Interrupt,
            event = source.next_event() => Step::Event(event),
        };

        match step {
            Step::Interrupt => {
                interrupted = true;
                let cancelled = source.cancel().await;
                debug!(cancelled, "Interrupted");
            }
            Step::Event(Some(ChatEvent::Status { phase, run_id })) => {
                debug!(phase = %phase, run_id = ?run_id, "Status");
            }
            Step::Event(Some(ChatEvent::Data { delta, .. })) => {
                stdout.write_all(delta.as_bytes()).await?;
                stdout.flush().await?;
            }
            Step::Event(Some(ChatEvent::Complete { .. })) | Step::Event(None) => {
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
                return Ok(());
            }
            Step::Event(Some(ChatEvent::Error { reason })) => {
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
                if interrupted && reason == "cancelled" {
                    eprintln!("[cancelled]");
                    return Ok(());
                }
                bail!(reason);
            }
        }
    }
}

async fn run_chat(
    app: App,
    message: String,
    conversation: Option<String>,
    preset: Option<String>,
    model: Option<String>,
    attach: Option<PathBuf>,
    no_stream: bool,
) -> Result<()> {
    app.require_key()?;

    let preset = match preset {
        Some(id) => Some(
            PresetStore::new(app.kv.clone())
                .get(&id)
                .await?
                .ok_or_else(|| anyhow!("no preset with id {}", id))?,
        ),
        None => None,
    };

    let conversation = conversation
        .or_else(|| preset.as_ref().map(|p| p.id.clone()))
        .unwrap_or_else(|| DEFAULT_CONVERSATION.to_string());
    let model = model.or_else(|| preset.as_ref().and_then(|p| p.model.clone()));
    let mut options = preset.map(|p| p.send_options()).unwrap_or_default();

    let http = LlmHttpClient::default();
    let files = Arc::new(app.files(http.clone()));
    if let Some(path) = attach {
        let file = files
            .upload_file(&path)
            .await
            .with_context(|| format!("uploading {}", path.display()))?;
        info!(file_id = %file.id, "Attachment uploaded");
        options.attachment = Some(file);
    }

    let controller = ConversationController::new(
        conversation,
        app.kv.clone(),
        Arc::new(HttpTransport::new(http)),
        app.credentials.clone(),
        app.settings.clone(),
    )
    .with_files(files);
    controller.load().await?;

    if no_stream {
        let completion = controller.send_and_wait(&message, model.as_deref(), options).await?;
        debug!(model = %completion.model, usage = ?completion.usage, "Completion");
        println!("{}", completion.content);
        return Ok(());
    }

    let mut handle = controller.send(&message, model.as_deref(), options).await?;
    print_stream(&mut handle).await
}

async fn run_history(app: App, conversation: String) -> Result<()> {
    let mut store = MessageStore::new(app.kv.clone());
    if !store.load(&conversation).await {
        println!("No saved conversation named {}", conversation);
        return Ok(());
    }
    for message in store.history() {
        println!(
            "[{}] {}: {}",
            message.timestamp.format("%Y-%m-%d %H:%M"),
            message.role.as_str(),
            message.content
        );
    }
    Ok(())
}

async fn run_key(app: App, action: KeyAction) -> Result<()> {
    match action {
        KeyAction::Set { key } => {
            let creds = Credentials::store(app.kv.as_ref(), &key).await?;
            match creds.masked() {
                Some(masked) => println!("Saved API key {}", masked),
                None => println!("Empty key; stored key removed"),
            }
        }
        KeyAction::Show => match app.credentials.masked() {
            Some(masked) => println!("{}", masked),
            None => println!("No API key configured"),
        },
        KeyAction::Clear => {
            Credentials::clear(app.kv.as_ref()).await?;
            println!("Stored API key removed");
        }
    }
    Ok(())
}

async fn run_preset(app: App, action: PresetAction) -> Result<()> {
    let presets = PresetStore::new(app.kv.clone());
    match action {
        PresetAction::List => {
            let all = presets.list().await?;
            if all.is_empty() {
                println!("No presets");
            }
            for p in all {
                println!(
                    "{}\t{}\t{}",
                    p.id,
                    p.name,
                    p.model.as_deref().unwrap_or(app.settings.default_model.as_str())
                );
            }
        }
        PresetAction::Add {
            id,
            name,
            model,
            system_prompt,
            temperature,
            max_tokens,
        } => {
            let mut preset = Preset::new(id.clone(), name.unwrap_or_else(|| id.clone()));
            preset.model = model;
            preset.system_prompt = system_prompt;
            preset.temperature = temperature;
            preset.max_tokens = max_tokens;
            presets.upsert(preset).await?;
            println!("Saved preset {}", id);
        }
        PresetAction::Remove { id } => {
            if presets.remove(&id).await? {
                println!("Removed preset {}", id);
            } else {
                println!("No preset with id {}", id);
            }
        }
    }
    Ok(())
}

async fn run_upload(app: App, path: PathBuf) -> Result<()> {
    app.require_key()?;
    let file = app.files(LlmHttpClient::default()).upload_file(&path).await?;
    println!("{}\t{}\t{}", file.id, file.name, file.mime_type);
    Ok(())
}

async fn run_assistant(
    app: App,
    assistant: String,
    thread: Option<String>,
    message: Option<String>,
    no_stream: bool,
) -> Result<()> {
    app.require_key()?;
    let client = AssistantsClient::from_settings(&app.settings, app.credentials.clone());

    let thread_id = match thread {
        Some(id) => id,
        None => {
            let thread = client.create_thread().await?;
            eprintln!("thread: {}", thread.id);
            thread.id
        }
    };
    if let Some(text) = message {
        client.add_message(&thread_id, &text, None).await?;
    }

    if no_stream {
        let reply = client
            .run_to_completion(&thread_id, &assistant, RUN_POLL_INTERVAL)
            .await?;
        println!("{}", reply);
        return Ok(());
    }

    let mut run = client.stream_run(&thread_id, &assistant).await?;
    print_stream(&mut run).await
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Some(home) = dirs::home_dir() {
        let _ = dotenvy::from_path(home.join(".chatline/.env"));
    }
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        std::env::var("CHATLINE_LOG")
            .ok()
            .and_then(|l| l.parse::<Level>().ok())
            .unwrap_or(Level::INFO)
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let app = App::load().await?;

    match cli.command {
        Commands::Chat {
            message,
            conversation,
            preset,
            model,
            attach,
            no_stream,
        } => run_chat(app, message, conversation, preset, model, attach, no_stream).await,
        Commands::History { conversation } => run_history(app, conversation).await,
        Commands::Clear { conversation } => {
            MessageStore::new(app.kv.clone()).forget(&conversation).await?;
            println!("Cleared {}", conversation);
            Ok(())
        }
        Commands::Key { action } => run_key(app, action).await,
        Commands::Preset { action } => run_preset(app, action).await,
        Commands::Upload { path } => run_upload(app, path).await,
        Commands::Run {
            assistant,
            thread,
            message,
            no_stream,
        } => run_assistant(app, assistant, thread, message, no_stream).await,
    }
}
