use anyhow::Context;
use clap::{Parser, Subcommand};
use ollama_tokenizer::app::{AppState, Server};
use ollama_tokenizer::envconfig::{parse_model_map, EnvConfig, Host};
use ollama_tokenizer::{CacheState, TokenizerOptions, TokenizerService};
use std::io::{BufWriter, Read, Write};
use std::process;
use std::time::Duration;
use tracing::Level;

#[derive(Parser)]
#[command(name = "ollama-tokenizer")]
#[command(version)]
#[command(about = "Tokenize text with the tokenizer of any Ollama model", long_about = None)]
struct Cli {
    /// Extra `name=locator` mappings (repeatable, comma separated allowed)
    #[arg(short, long = "model-map", global = true)]
    models: Vec<String>,

    /// Model used when a requested name is unknown
    #[arg(long, global = true)]
    fallback: Option<String>,

    /// Models to load before serving
    #[arg(long, global = true, value_delimiter = ',')]
    preload: Vec<String>,

    /// Only use the models given with --model-map / TOKENIZER_MODELS
    #[arg(long, global = true)]
    no_defaults: bool,

    /// Transport timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Seconds a failed load is reported before it is retried
    #[arg(long, global = true, default_value_t = 0)]
    failure_backoff: u64,

    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// host:port, overrides TOKENIZER_HOST
        #[arg(long)]
        host: Option<String>,
    },
    /// Print the token ids of TEXT (or stdin)
    Tokenize { model: String, text: Option<String> },
    /// Print the token count of TEXT (or stdin)
    Count { model: String, text: Option<String> },
    /// List registered models and their cache state
    #[command(alias = "ls")]
    Models,
    /// Print the canonical model a name resolves to
    Resolve { model: String },
    /// Save a vocabulary-only GGUF for MODEL
    Extract { model: String, output: String },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn init_tracing(cli: &Cli) {
    let level = match (cli.verbose, &cli.command) {
        (0, Commands::Serve { .. }) => Level::INFO,
        (0, _) => Level::WARN,
        (1, _) => Level::INFO,
        (2, _) => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

// Built before any tokio runtime exists: the blocking HTTP client must not
// be created inside one.
fn build_service(cli: &Cli, env: &EnvConfig) -> anyhow::Result<TokenizerService> {
    let mut models = env.models.clone();
    for entry in &cli.models {
        models.extend(parse_model_map(entry));
    }

    let mut options = TokenizerOptions::new()
        .with_model_map(models)
        .with_timeout(cli.timeout.map(Duration::from_secs).unwrap_or(env.timeout))
        .with_failure_backoff(Duration::from_secs(cli.failure_backoff))
        .with_ollama_models_dir(env.ollama_models_dir.clone());

    if cli.no_defaults {
        options = options.without_default_models();
    }
    if let Some(fallback) = cli.fallback.clone().or_else(|| env.fallback.clone()) {
        options = options.with_fallback_model(fallback);
    }

    let preload = if cli.preload.is_empty() { &env.preload } else { &cli.preload };
    if matches!(cli.command, Commands::Serve { .. }) {
        options = options.with_preloaded_models(preload.iter().cloned());
    }

    options.build()
}

fn read_text(text: Option<String>) -> anyhow::Result<String> {
    match text {
        Some(text) => Ok(text),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
            Ok(buf)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let env = EnvConfig::from_env()?;
    let service = build_service(&cli, &env)?;

    match cli.command {
        Commands::Serve { host } => {
            let host = match host {
                Some(host) => Host::parse(&host)?,
                None => env.host.clone(),
            };
            let state = AppState {
                service: service.clone(),
                request_timeout: cli.timeout.map(Duration::from_secs).unwrap_or(env.timeout),
            };

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(Server::new(state).host(host).run())?;
        }
        Commands::Tokenize { model, text } => {
            let text = read_text(text)?;
            let tokens = service.tokenize(&model, &text)?;
            println!("{}", serde_json::to_string(&tokens)?);
        }
        Commands::Count { model, text } => {
            let text = read_text(text)?;
            println!("{}", service.count_tokens(&model, &text)?);
        }
        Commands::Models => {
            for status in service.cache_status() {
                match status.state {
                    CacheState::NotLoaded => println!("{}", status.name),
                    state => println!("{}\t{:?}", status.name, state),
                }
            }
        }
        Commands::Resolve { model } => {
            println!("{}", service.optimal_tokenizer_model(&model)?);
        }
        Commands::Extract { model, output } => {
            let file = std::fs::File::create(&output).with_context(|| format!("creating {}", output))?;
            let mut writer = BufWriter::new(file);
            let name = service.export_vocabulary(&model, &mut writer)?;
            writer.flush()?;
            println!("wrote vocabulary of {} to {}", name, output);
        }
    }

    Ok(())
}
