//! tcmsg: TummyCrypt messaging CLI
//!
//! Commands:
//!   config show                        - display current configuration
//!   conversation-id <a> <b>            - print the conversation identifier
//!   fingerprint <a> <b>                - print the conversation key fingerprint
//!   encrypt <a> <b> <message>          - encrypt a message, print the envelope as JSON
//!   decrypt <a> <b> [<envelope.json>]  - decrypt an envelope (file or stdin)
//!   demo                               - two-party conversation over an in-memory store
//!
//! Every key-related command takes `--scope` for scoped conversations.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use tcmsg_core::config::TcmsgConfig;
use tcmsg_core::{Conversation, ConversationId};
use tcmsg_crypto::{derive_conversation_key, ConversationKey, Envelope, KdfParams};
use tcmsg_sync::{ConversationSync, MemoryStore, TimelineView};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "tcmsg",
    version,
    about = "TummyCrypt messaging client",
    long_about = "tcmsg: derive conversation keys, encrypt and decrypt message envelopes"
)]
struct Cli {
    /// Path to tcmsg.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "TCMSG_CONFIG",
        default_value = "/etc/tcmsg/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "TCMSG_LOG")]
    log: Option<String>,

    /// Log format (json, text); overrides the config file
    #[arg(long, env = "TCMSG_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

/// The two participants of a conversation and its optional scope
#[derive(Args, Debug)]
struct PairArgs {
    /// First participant identifier
    participant_a: String,
    /// Second participant identifier
    participant_b: String,
    /// Conversation scope (e.g. a request or order id)
    #[arg(long, short = 's')]
    scope: Option<String>,
}

impl PairArgs {
    fn conversation(&self) -> Conversation {
        Conversation::between(&self.participant_a, &self.participant_b, self.scope.as_deref())
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Print the identifier of the conversation between two participants
    #[command(name = "conversation-id")]
    ConversationId {
        #[command(flatten)]
        pair: PairArgs,
    },

    /// Print the fingerprint of the conversation key (never the key itself)
    Fingerprint {
        #[command(flatten)]
        pair: PairArgs,
    },

    /// Encrypt a message for a conversation and print the envelope as JSON
    Encrypt {
        #[command(flatten)]
        pair: PairArgs,
        /// Message text
        message: String,
    },

    /// Decrypt an envelope (JSON) for a conversation
    Decrypt {
        #[command(flatten)]
        pair: PairArgs,
        /// Envelope file (default: read stdin)
        #[arg(long, short = 'i')]
        input: Option<PathBuf>,
    },

    /// Run a two-party conversation against an in-memory store
    Demo {
        /// Sender identity
        #[arg(long, default_value = "alice")]
        from: String,
        /// Recipient identity
        #[arg(long, default_value = "bob")]
        to: String,
        #[arg(long, short = 's')]
        scope: Option<String>,
        /// First message
        #[arg(long, default_value = "hello")]
        message: String,
        /// Reply from the recipient
        #[arg(long, default_value = "hi, got it")]
        reply: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| LogFormat::from_config(&config.logging.format));
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "tcmsg starting"
    );

    match cli.command {
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
        Commands::ConversationId { pair } => cmd_conversation_id(&pair),
        Commands::Fingerprint { pair } => cmd_fingerprint(&config, &pair),
        Commands::Encrypt { pair, message } => cmd_encrypt(&config, &pair, &message),
        Commands::Decrypt { pair, input } => cmd_decrypt(&config, &pair, input.as_deref()),
        Commands::Demo { from, to, scope, message, reply } => {
            cmd_demo(&config, &from, &to, scope.as_deref(), &message, &reply).await
        }
    }
}

// ── Config loading and logging ────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<TcmsgConfig> {
    TcmsgConfig::load(path).with_context(|| format!("loading config: {}", path.display()))
}

impl LogFormat {
    fn from_config(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // logs go to stderr so command output on stdout stays pipeable
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn derive_key(config: &TcmsgConfig, pair: &PairArgs) -> Result<ConversationKey> {
    let params = KdfParams {
        iterations: config.crypto.kdf_iterations,
    };
    derive_conversation_key(
        &pair.participant_a,
        &pair.participant_b,
        pair.scope.as_deref(),
        &params,
    )
    .context("deriving conversation key")
}

// ── `tcmsg config show` ───────────────────────────────────────────────────────

fn cmd_config_show(config: &TcmsgConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `tcmsg conversation-id` / `tcmsg fingerprint` ─────────────────────────────

fn cmd_conversation_id(pair: &PairArgs) -> Result<()> {
    println!("{}", pair.conversation().id);
    Ok(())
}

fn cmd_fingerprint(config: &TcmsgConfig, pair: &PairArgs) -> Result<()> {
    let key = derive_key(config, pair)?;
    println!("conversation: {}", pair.conversation().id);
    println!("fingerprint:  {}", key.fingerprint());
    Ok(())
}

// ── `tcmsg encrypt` / `tcmsg decrypt` ─────────────────────────────────────────

fn cmd_encrypt(config: &TcmsgConfig, pair: &PairArgs, message: &str) -> Result<()> {
    let key = derive_key(config, pair)?;
    let envelope = tcmsg_crypto::encrypt(message, &key).context("encrypting message")?;
    let json = serde_json::to_string_pretty(&envelope).context("serializing envelope")?;
    println!("{json}");
    Ok(())
}

fn cmd_decrypt(config: &TcmsgConfig, pair: &PairArgs, input: Option<&Path>) -> Result<()> {
    let raw = match input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading envelope: {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading envelope from stdin")?;
            buf
        }
    };
    let envelope: Envelope = serde_json::from_str(&raw).context("parsing envelope JSON")?;

    let key = derive_key(config, pair)?;
    let plaintext = tcmsg_crypto::decrypt(&envelope, &key)
        .with_context(|| format!("decrypting for conversation {}", pair.conversation().id))?;
    println!("{plaintext}");
    Ok(())
}

// ── `tcmsg demo` ──────────────────────────────────────────────────────────────

async fn cmd_demo(
    config: &TcmsgConfig,
    from: &str,
    to: &str,
    scope: Option<&str>,
    message: &str,
    reply: &str,
) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let conversation = Conversation::between(from, to, scope);
    let conversation_id: ConversationId = conversation.id.clone();

    let mut sender = ConversationSync::new(store.clone(), from, config);
    let mut recipient = ConversationSync::new(store.clone(), to, config);

    sender
        .open(conversation.clone())
        .await
        .with_context(|| format!("{from} opening {conversation_id}"))?;
    sender.load_history().await.context("loading sender history")?;
    let first = sender.send(message).await.context("sending message")?;

    recipient
        .open(conversation)
        .await
        .with_context(|| format!("{to} opening {conversation_id}"))?;
    let report = recipient
        .load_history()
        .await
        .context("loading recipient history")?;
    println!(
        "{to} loaded {} message(s), {} marked read",
        report.fetched, report.marked_read
    );
    print_view(to, &recipient.view());

    recipient.send(reply).await.context("sending reply")?;
    sender.drain_live().await;
    print_view(from, &sender.view());

    if let Some(record) = store.get(&first) {
        println!(
            "status of first message: {} (read_at: {})",
            record.status,
            record
                .read_at
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".into())
        );
    }
    println!("stored ciphertext records: {}", store.len());

    sender.close();
    recipient.close();
    Ok(())
}

fn print_view(identity: &str, view: &TimelineView) {
    let conversation = view
        .conversation_id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".into());
    println!("── {identity} @ {conversation} ({:?})", view.phase);
    for message in &view.messages {
        println!(
            "  [{}] {} → {}: {}  ({})",
            message.record.created_at,
            message.record.sender,
            message.record.recipient,
            view.display_text(message),
            message.record.status,
        );
    }
    if let Some(notice) = &view.notice {
        println!("  notice: {notice}");
    }
}
