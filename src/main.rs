use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fingermatch::config;
use fingermatch::response::{self, MatchRequest};
use fingermatch::Matcher;
use log::info;

#[derive(Parser)]
#[command(name = "fingermatch")]
#[command(version, about = "Fingerprint identification against a pre-built gallery")]
struct Cli {
    /// Config file (defaults to the compiled-in path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Match one fingerprint image and print the JSON response
    Match {
        /// Probe image
        #[arg(short, long)]
        image: PathBuf,
        /// Opaque caller tag echoed back in the response
        #[arg(short, long)]
        tag: Option<String>,
    },
    /// Load model, gallery and index and report what was found
    Check,
    /// Open config file in editor
    Config,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Match { image, tag } => run_match(config_path, image, tag),
        Commands::Check => check(config_path),
        Commands::Config => open_config(config_path),
    }
}

fn load_matcher(config_path: Option<&Path>) -> Result<Matcher> {
    let cfg = config::load_config(config_path)?;
    Matcher::from_config(&cfg).context("Failed to load matcher")
}

fn run_match(config_path: Option<&Path>, image: PathBuf, tag: Option<String>) -> Result<()> {
    let matcher = load_matcher(config_path)?;

    let res = response::handle(
        &matcher,
        MatchRequest {
            image_path: image,
            requester_tag: tag,
        },
    );
    println!("{}", serde_json::to_string_pretty(&res)?);

    if !res.success {
        std::process::exit(if res.status == 200 { 1 } else { 2 });
    }
    Ok(())
}

fn check(config_path: Option<&Path>) -> Result<()> {
    let matcher = load_matcher(config_path)?;
    let opts = matcher.options();

    info!("✓ Model loaded, embedding dimension {}", matcher.extractor().dim());
    info!(
        "✓ Gallery: {} entries, dimension {}",
        matcher.gallery().len(),
        matcher.gallery().dim()
    );
    info!(
        "✓ Index: {} elements, {} levels, ef {}",
        matcher.index().len(),
        matcher.index().max_level() + 1,
        matcher.index().ef()
    );
    info!("Search: top_k {}, policy {:?}", opts.top_k, opts.policy);
    Ok(())
}

fn open_config(config_path: Option<&Path>) -> Result<()> {
    let config_path = config_path.unwrap_or(&config::CONFIG_PATH);
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
