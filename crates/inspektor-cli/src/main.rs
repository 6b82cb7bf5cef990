use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use inspektor_agents::{LlmPlanner, LlmProvider, prompt};
use inspektor_common::{
    ConversationId, DatastoreId, Message, MessagePayload, MetadataSnapshot, WorkspaceId,
};
use inspektor_config::{AppConfig, ConfigLoader};
use inspektor_db::{DEFAULT_TTL_HOURS, MetadataCache, SessionStore, WorkspaceContextStore};
use inspektor_engine::EngineOptions;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "inspektor",
    version,
    about = "Inspektor - natural-language SQL without handing your data to the model"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory holding config.yml / config.toml
    #[arg(long, global = true, env = "INSPEKTOR_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config and data directories and a default config.yml
    Init,

    /// Show configuration and stored state
    Status {
        /// Also ping the configured planner provider
        #[arg(long)]
        check_planner: bool,
    },

    /// Inspect and manage conversations
    Conversations {
        #[command(subcommand)]
        action: ConversationCommands,
    },

    /// Inspect and manage the schema metadata cache
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },

    /// Inspect and manage knowledge shared across a workspace's conversations
    Context {
        #[command(subcommand)]
        action: ContextCommands,
    },
}

#[derive(Subcommand)]
enum ConversationCommands {
    /// List conversations, most recently active first
    List {
        #[arg(long)]
        datastore: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Print the full message history of a conversation
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Delete a conversation and its messages
    Delete { id: String },
    /// Set a conversation's title
    Rename { id: String, title: String },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Print the cached metadata for a datastore
    Show {
        datastore: String,
        #[arg(long)]
        json: bool,
    },
    /// Drop the cached metadata for a datastore
    Clear { datastore: String },
    /// Remove every expired cache entry
    Cleanup,
}

#[derive(Subcommand)]
enum ContextCommands {
    /// Print the learned context of a workspace
    Show {
        workspace: String,
        #[arg(long)]
        json: bool,
    },
    /// Forget everything learned for a workspace
    Clear { workspace: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let config_loader = match &cli.config_dir {
        Some(dir) => ConfigLoader::with_dir(dir),
        None => ConfigLoader::new()?,
    };
    let config = config_loader.load()?;

    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level)),
        )
        .init();
    debug!("using config dir {}", config_loader.config_dir().display());

    match cli.command {
        Commands::Init => init(&config_loader, &config)?,
        Commands::Status { check_planner } => {
            status(&config_loader, &config, check_planner).await?
        }
        Commands::Conversations { action } => {
            let store = open_store(&config_loader, &config)?;
            conversations(&store, action)?;
        }
        Commands::Cache { action } => {
            let cache = open_cache(&config_loader, &config)?;
            cache_command(&cache, action)?;
        }
        Commands::Context { action } => {
            let contexts = open_contexts(&config_loader, &config)?;
            context_command(&contexts, action)?;
        }
    }

    Ok(())
}

fn init(loader: &ConfigLoader, config: &AppConfig) -> Result<()> {
    loader.ensure_dirs(config)?;
    println!("Inspektor setup");
    println!("Config directory: {}", loader.config_dir().display());

    if loader.config_file_exists() {
        println!("Config file already present, leaving it untouched.");
    } else {
        let path = loader.config_dir().join("config.yml");
        let yaml = serde_yaml::to_string(&AppConfig::default())
            .context("failed to render default config")?;
        std::fs::write(&path, yaml)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("wrote default config to {}", path.display());
        println!("Wrote {}", path.display());
    }

    let store = open_store(loader, config)?;
    open_cache(loader, config)?;
    debug!(
        conversations = store.count_conversations()?,
        "state database ready"
    );
    println!("Database: {}", loader.database_path(config).display());
    println!(
        "Set planner.api_key in the config or OPENAI_API_KEY in the environment to get started."
    );
    Ok(())
}

async fn status(loader: &ConfigLoader, config: &AppConfig, check_planner: bool) -> Result<()> {
    let options = EngineOptions::from(config);
    let db_path = loader.database_path(config);

    println!("Inspektor status");
    println!("  config dir:      {}", loader.config_dir().display());
    println!(
        "  config file:     {}",
        if loader.config_file_exists() { "found" } else { "none (defaults)" }
    );
    println!("  database:        {}", db_path.display());
    println!("  schema version:  {}", inspektor_db::schema_version());
    println!(
        "  planner:         {} / {}",
        config.planner.provider,
        config.planner.model.as_deref().unwrap_or("default model")
    );
    println!(
        "  auto-approve:    {} (bound {})",
        if options.auto_approve { "on" } else { "off" },
        options.auto_approve_bound
    );
    println!(
        "  corrections:     {} attempts, planner timeout {}s, executor timeout {}s",
        options.max_correction_attempts,
        options.planner_timeout.as_secs(),
        options.executor_timeout.as_secs()
    );
    println!("  history limit:   {} messages", options.history_limit);
    println!("  cache ttl:       {}h", config.cache.ttl_hours);

    if db_path.exists() {
        let store = SessionStore::open(&db_path)?;
        println!("  conversations:   {}", store.count_conversations()?);
    } else {
        println!("  conversations:   0 (database not created yet, run `inspektor init`)");
    }

    if check_planner {
        let planner = LlmPlanner::from_config(&config.planner)?;
        let healthy = planner.provider().health_check().await?;
        println!(
            "  planner check:   {}",
            if healthy { "reachable" } else { "unreachable" }
        );
    }

    Ok(())
}

fn conversations(store: &SessionStore, action: ConversationCommands) -> Result<()> {
    match action {
        ConversationCommands::List {
            datastore,
            limit,
            json,
        } => {
            let datastore = datastore.map(DatastoreId::from_str);
            let list = store.list_conversations(datastore.as_ref(), limit, 0)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
                return Ok(());
            }
            if list.is_empty() {
                println!("No conversations.");
            }
            for conversation in list {
                println!(
                    "{}  {}  {}  {}",
                    conversation.id,
                    conversation.datastore_id,
                    conversation.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    conversation.title.as_deref().unwrap_or("(untitled)")
                );
            }
        }
        ConversationCommands::Show { id, json } => {
            let id = ConversationId::from_str(id);
            let conversation = store.get_conversation(&id)?;
            let messages = store.messages(&id)?;
            if json {
                let body = serde_json::json!({
                    "conversation": conversation,
                    "messages": messages,
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
                return Ok(());
            }
            println!(
                "{} ({}) on {}",
                conversation.title.as_deref().unwrap_or("(untitled)"),
                conversation.id,
                conversation.datastore_id
            );
            for message in &messages {
                println!("{}", render_message(message));
            }
        }
        ConversationCommands::Delete { id } => {
            let id = ConversationId::from_str(id);
            if store.delete_conversation(&id)? {
                println!("Deleted conversation {id}");
            } else {
                anyhow::bail!("conversation {id} not found");
            }
        }
        ConversationCommands::Rename { id, title } => {
            let id = ConversationId::from_str(id);
            store.update_title(&id, &title)?;
            println!("Renamed conversation {id} to {title:?}");
        }
    }
    Ok(())
}

fn cache_command(cache: &MetadataCache, action: CacheCommands) -> Result<()> {
    match action {
        CacheCommands::Show { datastore, json } => {
            let datastore = DatastoreId::from_str(datastore);
            match cache.get(&datastore)? {
                Some(snapshot) if json => {
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                }
                Some(snapshot) => print!("{}", render_snapshot(&snapshot)),
                None => println!("No fresh metadata cached for {datastore}."),
            }
        }
        CacheCommands::Clear { datastore } => {
            let datastore = DatastoreId::from_str(datastore);
            if cache.invalidate(&datastore)? {
                println!("Cleared cached metadata for {datastore}");
            } else {
                println!("Nothing cached for {datastore}");
            }
        }
        CacheCommands::Cleanup => {
            let removed = cache.cleanup_expired()?;
            let noun = if removed == 1 { "entry" } else { "entries" };
            println!("Removed {removed} expired cache {noun}");
        }
    }
    Ok(())
}

fn context_command(contexts: &WorkspaceContextStore, action: ContextCommands) -> Result<()> {
    match action {
        ContextCommands::Show { workspace, json } => {
            let workspace = WorkspaceId::from_str(workspace);
            match contexts.get_full(&workspace)? {
                Some(stored) if json => {
                    println!("{}", serde_json::to_string_pretty(&stored)?);
                }
                Some(stored) => {
                    println!(
                        "Workspace {} (updated {})",
                        stored.workspace_id,
                        stored.updated_at.format("%Y-%m-%d %H:%M:%S")
                    );
                    println!("{}", prompt::format_workspace_context(&stored.context));
                }
                None => println!("Nothing learned yet for workspace {workspace}."),
            }
        }
        ContextCommands::Clear { workspace } => {
            let workspace = WorkspaceId::from_str(workspace);
            if contexts.delete(&workspace)? {
                println!("Cleared context for workspace {workspace}");
            } else {
                println!("No context stored for workspace {workspace}");
            }
        }
    }
    Ok(())
}

fn open_contexts(loader: &ConfigLoader, config: &AppConfig) -> Result<WorkspaceContextStore> {
    loader.ensure_dirs(config)?;
    Ok(WorkspaceContextStore::open(&loader.database_path(config))?)
}

fn open_store(loader: &ConfigLoader, config: &AppConfig) -> Result<SessionStore> {
    loader.ensure_dirs(config)?;
    Ok(SessionStore::open(&loader.database_path(config))?)
}

fn open_cache(loader: &ConfigLoader, config: &AppConfig) -> Result<MetadataCache> {
    loader.ensure_dirs(config)?;
    Ok(MetadataCache::open(
        &loader.database_path(config),
        cache_ttl(config.cache.ttl_hours),
    )?)
}

fn cache_ttl(hours: u64) -> chrono::Duration {
    i64::try_from(hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .unwrap_or_else(|| chrono::Duration::hours(DEFAULT_TTL_HOURS))
}

fn render_message(message: &Message) -> String {
    let stamp = message.timestamp.format("%H:%M:%S");
    let role = message.role.as_str();
    let detail = match &message.payload {
        Some(MessagePayload::MetadataRequest { request }) => {
            format!("[requests {}] {}", request.label(), message.content)
        }
        Some(MessagePayload::Continue { summary, .. }) => format!("[continue] {summary}"),
        Some(MessagePayload::Sql {
            sql, confidence, ..
        }) => format!(
            "{}\n    sql ({}): {sql}",
            message.content,
            confidence.as_str()
        ),
        Some(MessagePayload::Clarification { question }) => format!("[clarify] {question}"),
        Some(MessagePayload::ExecutionFailure { attempt, .. }) => {
            format!("[attempt {attempt}] {}", message.content)
        }
        Some(MessagePayload::ExecutionSuccess { .. }) => format!("[executed] {}", message.content),
        Some(MessagePayload::Failure { error_kind, .. }) => {
            format!("[{error_kind}] {}", message.content)
        }
        None => message.content.clone(),
    };
    format!("{stamp} {role:>9}: {detail}")
}

fn render_snapshot(snapshot: &MetadataSnapshot) -> String {
    let mut out = format!(
        "Datastore {} (merged {})\n",
        snapshot.datastore_id,
        snapshot.merged_at.format("%Y-%m-%d %H:%M:%S")
    );
    let tables: Vec<&str> = snapshot.tables.iter().map(String::as_str).collect();
    out.push_str(&format!(
        "Tables{}: {}\n",
        if snapshot.tables_fetched { "" } else { " (partial)" },
        if tables.is_empty() { "-".to_string() } else { tables.join(", ") }
    ));
    for (table, columns) in &snapshot.schemas {
        let columns: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.data_type))
            .collect();
        out.push_str(&format!("  {table}: {}\n", columns.join(", ")));
    }
    if snapshot.relationships_fetched {
        out.push_str(&format!("Relationships: {}\n", snapshot.relationships.len()));
        for edge in &snapshot.relationships {
            out.push_str(&format!(
                "  {}.{} -> {}.{}\n",
                edge.from_table, edge.from_column, edge.to_table, edge.to_column
            ));
        }
    }
    out
}
