mod commands;
mod logging;
mod serve;

use anyhow::Context;
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use commands::{Command, CommandResult};
use config::{ModelRegistry, PathManager, Settings, load_env_file};
use llm::{ChatModel, GenerationOptions, LlamaProvider, ModelProvider};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use wgpt_core::{
    ChatError, ConversationId, ConversationStorage, EngineEvent, GenerationController, MemoryStorage,
    MessageDisplay, MessageId, MessageKind, SqliteStorage,
};

const APP_NAME: &str = "WarriorGPT";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the inference server (defaults to settings.toml, then the
    /// model's models.yaml port)
    #[arg(long, env = "WGPT_SERVER_URL")]
    server_url: Option<String>,

    #[arg(long, env = "WGPT_API_KEY")]
    api_key: Option<String>,

    /// Model to chat with
    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    system_message: Option<String>,

    /// Keep conversations in memory only
    #[arg(long)]
    memory: bool,

    /// Data directory (database, settings, models.yaml)
    #[arg(long, env = "WGPT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Interactive chat (default)
    Chat,
    /// Write the props document derived from models.yaml
    Props {
        /// models.yaml to read (defaults to the one in the data directory)
        #[arg(long)]
        registry: Option<PathBuf>,
        /// Output file; printed to stdout when omitted
        #[arg(long, short)]
        output: Option<PathBuf>,
        #[arg(long, default_value = APP_NAME)]
        app_name: String,
    },
    /// List the models offered by the server
    Models,
    /// Start a llama-server for every models.yaml entry and stop them on Ctrl+C
    Serve {
        /// models.yaml to read (defaults to the one in the data directory)
        #[arg(long)]
        registry: Option<PathBuf>,
        /// Directory the model paths are relative to (defaults to the
        /// directory holding models.yaml)
        #[arg(long)]
        models_dir: Option<PathBuf>,
        #[arg(long, env = "WGPT_LLAMA_SERVER", default_value = serve::DEFAULT_SERVER_BIN)]
        server_bin: String,
    },
}

type Controller = GenerationController<Arc<dyn ConversationStorage>>;

/// Where each model is served
struct Endpoints {
    registry: ModelRegistry,
    /// Explicit server URL; wins over the registry ports
    server_url: Option<String>,
    fallback_url: String,
    api_key: Option<String>,
}

impl Endpoints {
    fn url_for(&self, model: Option<&str>) -> String {
        self.server_url
            .clone()
            .or_else(|| model.and_then(|m| self.registry.endpoint(m)))
            .unwrap_or_else(|| self.fallback_url.clone())
    }

    fn provider_for(&self, model: Option<&str>) -> anyhow::Result<LlamaProvider> {
        LlamaProvider::new(&self.url_for(model), self.api_key.as_deref())
    }

    fn create_model(&self, model: &str) -> anyhow::Result<Arc<dyn ChatModel + Send + Sync>> {
        self.provider_for(Some(model))?
            .create_chat_model(model)
            .with_context(|| format!("Failed to create model {}", model))
    }

    /// Explicit choice, then settings, then the registry default, then whatever
    /// the server lists first
    async fn pick_model(&self, requested: Option<String>) -> anyhow::Result<String> {
        if let Some(name) = requested.or_else(|| self.registry.default_model().map(str::to_string)) {
            return Ok(name);
        }
        match self.provider_for(None)?.list_models().await {
            Ok(models) => models
                .into_iter()
                .next()
                .map(|m| m.name)
                .context("The server offers no models"),
            Err(e) => {
                tracing::warn!("could not list models: {:#}", e);
                Ok("default".to_string())
            }
        }
    }
}

// Application state
struct AppState {
    controller: Controller,
    conversation: ConversationId,
    endpoints: Endpoints,
    show_reasoning: bool,
    /// Pending message being echoed and how much of it is already on screen
    echo: Option<Echo>,
}

struct Echo {
    id: MessageId,
    content: usize,
    reasoning: usize,
}

impl AppState {
    async fn execute(&mut self, command: Command) -> anyhow::Result<CommandResult> {
        let conv = self.conversation.clone();
        match command {
            Command::Quit => {
                println!("Goodbye!");
                return Ok(CommandResult::Exit);
            }
            Command::Help => commands::print_help(),
            Command::New => {
                self.conversation = self.controller.new_conversation();
                println!("Started a new conversation.");
            }
            Command::Stop => {
                if !self.controller.stop(&conv) {
                    println!("Nothing is being generated.");
                }
            }
            Command::Regenerate => {
                let view = self.controller.display(&conv);
                match last_of_kind(&view.messages, MessageKind::Assistant) {
                    Some(id) => {
                        self.controller.regenerate(&conv, id)?;
                    }
                    None => println!("No answer to regenerate."),
                }
            }
            Command::Edit(text) => {
                let view = self.controller.display(&conv);
                match last_of_kind(&view.messages, MessageKind::User) {
                    Some(id) => {
                        self.controller.edit(&conv, id, text, None)?;
                    }
                    None => println!("No message to edit."),
                }
            }
            Command::Previous(position) => self.switch_branch(position, false)?,
            Command::Next(position) => self.switch_branch(position, true)?,
            Command::History => self.print_history(),
            Command::Models => {
                let provider = self.endpoints.provider_for(Some(self.controller.model_name()))?;
                for model in provider.list_models().await? {
                    let marker = if model.name == self.controller.model_name() { "*" } else { " " };
                    println!("{} {} ({})", marker, model.label(), model.name);
                }
            }
            Command::Model(name) => {
                let model = self.endpoints.create_model(&name)?;
                self.controller.set_model(model);
                println!("Switched to {}", name);
            }
            Command::List => {
                for info in self.controller.list_conversations().await? {
                    println!(
                        "{}  {:>3} messages  {}",
                        info.id,
                        info.message_count,
                        info.name.as_deref().unwrap_or("(untitled)")
                    );
                }
            }
            Command::Open(prefix) => {
                let infos = self.controller.list_conversations().await?;
                let matches: Vec<_> = infos
                    .iter()
                    .filter(|i| i.id.as_str().starts_with(prefix.as_str()))
                    .collect();
                match matches.as_slice() {
                    [info] => {
                        self.controller.open_conversation(&info.id).await?;
                        self.conversation = info.id.clone();
                        self.print_history();
                    }
                    [] => println!("No conversation matches {}", prefix),
                    _ => println!("{} conversations match {}", matches.len(), prefix),
                }
            }
        }
        println!();
        Ok(CommandResult::Continue)
    }

    fn switch_branch(&mut self, position: Option<usize>, forward: bool) -> anyhow::Result<()> {
        let view = self.controller.display(&self.conversation);
        let node = match position {
            Some(n) => view.messages.get(n - 1),
            None => view.messages.iter().rev().find(|d| d.sibling_count() > 1),
        };
        let Some(node) = node else {
            println!("No branch to switch.");
            return Ok(());
        };

        let target = if forward {
            node.next_sibling_leaf()
        } else {
            node.previous_sibling_leaf()
        };
        match target {
            Some(leaf) => {
                self.controller.select_leaf(&self.conversation, Some(leaf))?;
                self.print_history();
            }
            None => println!("No further branch in that direction."),
        }
        Ok(())
    }

    fn print_history(&self) {
        let view = self.controller.display(&self.conversation);
        for (i, node) in view.messages.iter().enumerate() {
            let branch = if node.sibling_count() > 1 {
                format!(" [{}/{}]", node.sibling_curr_idx + 1, node.sibling_count())
            } else {
                String::new()
            };
            println!("{:>2}. {}{}: {}", i + 1, node.message.kind.as_str(), branch, node.message.content);
        }
        if let Some(pending) = view.pending {
            println!("    assistant (generating): {}", pending.content);
        }
    }

    fn handle_event(&mut self, event: EngineEvent) -> io::Result<()> {
        match event {
            EngineEvent::PendingUpdated {
                conversation_id,
                message,
            } => {
                if conversation_id != self.conversation {
                    return Ok(());
                }
                if self.echo.as_ref().map(|e| e.id) != Some(message.id) {
                    self.echo = Some(Echo {
                        id: message.id,
                        content: 0,
                        reasoning: 0,
                    });
                }
                let Some(echo) = self.echo.as_mut() else {
                    return Ok(());
                };
                let mut out = io::stdout().lock();
                if self.show_reasoning {
                    if let Some(reasoning) = message.reasoning.as_deref() {
                        if let Some(new) = reasoning.get(echo.reasoning..) {
                            write!(out, "{}", new)?;
                            echo.reasoning = reasoning.len();
                        }
                    }
                }
                if let Some(new) = message.content.get(echo.content..) {
                    write!(out, "{}", new)?;
                    echo.content = message.content.len();
                }
                out.flush()?;
            }
            EngineEvent::Committed {
                conversation_id,
                message_id,
                cancelled,
            } => {
                self.echo = None;
                if conversation_id != self.conversation {
                    return Ok(());
                }
                println!();
                if cancelled {
                    println!("[stopped]");
                }
                let speed = self
                    .controller
                    .message(&conversation_id, message_id)
                    .and_then(|m| m.timings)
                    .and_then(|t| t.tokens_per_second());
                if let Some(tps) = speed {
                    println!("[{:.1} tokens/s]", tps);
                }
                println!();
            }
            EngineEvent::Failed { reason, .. } => {
                self.echo = None;
                println!();
                eprintln!("Generation failed: {}", reason);
            }
            EngineEvent::Error(e) => eprintln!("Error: {}", e),
        }
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> anyhow::Result<CommandResult> {
        let input = line.trim();
        if input.is_empty() {
            return Ok(CommandResult::Continue);
        }

        if input.starts_with('/') {
            return match Command::parse(input) {
                Ok(cmd) => self.execute(cmd).await,
                Err(err) => {
                    println!("{}", err);
                    println!();
                    Ok(CommandResult::Continue)
                }
            };
        }

        match self.controller.send(&self.conversation, None, input) {
            Ok(_) => {}
            Err(ChatError::AlreadyGenerating(_)) => {
                println!("Still answering; wait or /stop first.");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(CommandResult::Continue)
    }
}

fn last_of_kind(path: &[MessageDisplay], kind: MessageKind) -> Option<MessageId> {
    path.iter()
        .rev()
        .find(|d| d.message.kind == kind)
        .map(|d| d.message.id)
}

fn write_props(
    registry: Option<PathBuf>,
    output: Option<PathBuf>,
    app_name: &str,
) -> anyhow::Result<()> {
    let path = registry
        .or_else(PathManager::models_registry_path)
        .context("No models.yaml location available")?;
    let props = ModelRegistry::load(&path)?.props(app_name);
    match output {
        Some(output) => {
            props.write(&output)?;
            println!("Wrote {} models to {}", props.models.len(), output.display());
        }
        None => println!("{}", props.to_json()?),
    }
    Ok(())
}

async fn serve_models(
    registry: Option<PathBuf>,
    models_dir: Option<PathBuf>,
    server_bin: &str,
) -> anyhow::Result<()> {
    let path = registry
        .or_else(PathManager::models_registry_path)
        .context("No models.yaml location available")?;
    let models_dir = models_dir
        .or_else(|| path.parent().map(PathBuf::from))
        .or_else(PathManager::models_dir)
        .context("No models directory available")?;
    let registry = ModelRegistry::load(&path)?;
    serve::run(&registry, &models_dir, server_bin).await
}

fn load_registry() -> ModelRegistry {
    let Some(path) = PathManager::models_registry_path() else {
        return ModelRegistry::default();
    };
    if !path.exists() {
        return ModelRegistry::default();
    }
    ModelRegistry::load(&path).unwrap_or_else(|e| {
        tracing::warn!("ignoring {}: {:#}", path.display(), e);
        ModelRegistry::default()
    })
}

fn open_storage(memory: bool) -> anyhow::Result<Arc<dyn ConversationStorage>> {
    if memory {
        return Ok(Arc::new(MemoryStorage::new()));
    }
    PathManager::ensure_dirs_exist()?;
    let db_path = PathManager::db_path().context("No data directory available")?;
    tracing::debug!("using database {}", db_path.display());
    Ok(Arc::new(SqliteStorage::open(&db_path)?))
}

/// Read stdin on a plain thread so the event loop never blocks on input
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("Error reading input: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

async fn run_chat(args: Args) -> anyhow::Result<()> {
    let settings = Settings::load();
    let endpoints = Endpoints {
        registry: load_registry(),
        server_url: args.server_url,
        fallback_url: settings.server_url.clone(),
        api_key: args.api_key.or_else(|| settings.api_key.clone()),
    };

    let model_name = endpoints
        .pick_model(args.model.or_else(|| settings.default_model.clone()))
        .await?;
    let model = endpoints.create_model(&model_name)?;
    let controller = GenerationController::new(open_storage(args.memory)?, model)
        .with_system_message(args.system_message.or_else(|| settings.system_message.clone()))
        .with_options(GenerationOptions {
            model: None,
            params: settings.sampling_params(),
        });

    let mut state = AppState {
        conversation: controller.new_conversation(),
        controller,
        endpoints,
        show_reasoning: settings.show_reasoning,
        echo: None,
    };

    println!();
    println!("{} • {}", APP_NAME, model_name);
    println!("Type /help for commands, Ctrl+D or /quit to exit.");
    println!();

    let mut lines = spawn_stdin_reader();
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else {
                    println!();
                    println!("Goodbye!");
                    break;
                };
                match state.handle_line(&line).await {
                    Ok(CommandResult::Exit) => break,
                    Ok(CommandResult::Continue) => {}
                    Err(e) => eprintln!("Error: {:#}", e),
                }
            }
            Some(event) = state.controller.next_event() => {
                state.handle_event(event)?;
            }
        }
    }

    if state.controller.stop(&state.conversation) {
        // the stopped generation still commits and saves
        while let Some(event) = state.controller.next_event().await {
            if matches!(event, EngineEvent::Committed { .. } | EngineEvent::Failed { .. }) {
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env_file();
    let mut args = Args::parse();
    logging::init(args.verbose);

    if let Some(dir) = &args.data_dir {
        PathManager::set_data_dir(dir.clone());
    }

    match args.action.take() {
        Some(Action::Props {
            registry,
            output,
            app_name,
        }) => write_props(registry, output, &app_name),
        Some(Action::Models) => {
            let settings = Settings::load();
            let url = args.server_url.unwrap_or(settings.server_url);
            let provider = LlamaProvider::new(&url, args.api_key.or(settings.api_key).as_deref())?;
            for model in provider.list_models().await? {
                println!("{}\t{}", model.name, model.label());
            }
            Ok(())
        }
        Some(Action::Serve {
            registry,
            models_dir,
            server_bin,
        }) => serve_models(registry, models_dir, &server_bin).await,
        Some(Action::Chat) | None => run_chat(args).await,
    }
}
