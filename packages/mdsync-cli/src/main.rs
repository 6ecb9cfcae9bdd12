use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use mdsync::{ConflictPolicy, Pipeline, Source, SyncConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mdsync")]
#[command(about = "Upload local Markdown images and rewrite links to their public URLs", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to $MDSYNC_CONFIG, then ~/.config/mdsync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload images referenced from a document or directory of documents
    Upload(UploadArgs),

    /// Show the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

#[derive(Args)]
struct UploadArgs {
    /// Markdown file to process
    #[arg(short, long, conflicts_with = "dir", required_unless_present = "dir")]
    file: Option<PathBuf>,

    /// Directory to scan for Markdown files
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Storage provider (local)
    #[arg(long)]
    provider: Option<String>,

    /// Bucket name
    #[arg(long)]
    bucket: Option<String>,

    /// Root directory for the local provider
    #[arg(long)]
    root: Option<PathBuf>,

    /// Key prefix inside the bucket
    #[arg(long)]
    prefix: Option<String>,

    /// Domain used for public URLs instead of the provider's own
    #[arg(long)]
    custom_domain: Option<String>,

    /// Report what would change without uploading or writing files
    #[arg(long)]
    dry_run: bool,

    /// Number of concurrent uploads
    #[arg(long)]
    concurrency: Option<usize>,

    /// Upload even if the cache or remote already has the image
    #[arg(short = 'F', long)]
    force: bool,

    /// What to do when the remote path is taken: rename, version, overwrite
    #[arg(long)]
    conflict: Option<ConflictPolicy>,

    /// Directory holding the upload cache
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Document extensions to scan, e.g. `md,mdx`
    #[arg(long = "include", value_name = "EXT", value_delimiter = ',')]
    extensions: Vec<String>,

    /// Exit with an error if any image failed to upload
    #[arg(long)]
    fail_on_error: bool,
}

impl UploadArgs {
    fn source(&self) -> Option<Source> {
        match (&self.file, &self.dir) {
            (Some(file), _) => Some(Source::File(file.clone())),
            (None, Some(dir)) => Some(Source::Directory(dir.clone())),
            (None, None) => None,
        }
    }

    /// Command-line values take precedence over the config file
    fn apply(&self, mut config: SyncConfig) -> SyncConfig {
        if let Some(provider) = &self.provider {
            config.provider.provider = provider.clone();
        }
        if let Some(bucket) = &self.bucket {
            config.provider.bucket = bucket.clone();
        }
        if let Some(root) = &self.root {
            config.provider.root = Some(root.clone());
        }
        if let Some(prefix) = &self.prefix {
            config.provider.prefix = prefix.clone();
        }
        if let Some(domain) = &self.custom_domain {
            config.provider.custom_domain = Some(domain.clone());
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(conflict) = self.conflict {
            config.conflict = conflict;
        }
        if let Some(cache_dir) = &self.cache_dir {
            config.cache_dir = cache_dir.clone();
        }
        if !self.extensions.is_empty() {
            config.extensions = self.extensions.clone();
        }
        config.dry_run |= self.dry_run;
        config.force |= self.force;
        config.normalized()
    }
}

async fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::load_from(path).await,
        None => SyncConfig::load().await,
    }
}

async fn upload(config: SyncConfig, args: &UploadArgs) -> Result<()> {
    let source = args.source().context("Either --file or --dir must be specified")?;
    let config = args.apply(config);

    let pipeline = Pipeline::new(config).await?;

    let cancel = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight uploads");
            cancel.cancel();
        }
    });

    let stats = pipeline.run(&source).await?;
    println!("{}", stats);

    if args.fail_on_error && stats.has_failures() {
        bail!("{} images failed to upload", stats.failed);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref()).await?;

    match cli.command {
        Commands::Upload(args) => upload(config, &args).await,
        Commands::Config { init } => {
            if init {
                match &cli.config {
                    Some(path) => config.save_to(path).await?,
                    None => config.save().await?,
                }
                tracing::info!("Configuration saved");
            }
            print!("{}", toml::to_string_pretty(&config).context("Failed to serialize config")?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "mdsync",
            "upload",
            "--dir",
            "docs",
            "--provider",
            "local",
            "--concurrency",
            "8",
            "--conflict",
            "version",
            "--include",
            ".MDX",
            "-F",
        ])
        .unwrap();
        let Commands::Upload(args) = cli.command else {
            panic!("expected upload command");
        };

        let config = args.apply(SyncConfig::default());
        assert_eq!(config.provider.provider, "local");
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.conflict, ConflictPolicy::Version);
        assert_eq!(config.extensions, vec!["mdx".to_string()]);
        assert!(config.force);
        assert!(!config.dry_run);
        assert!(matches!(args.source(), Some(Source::Directory(p)) if p == PathBuf::from("docs")));
    }

    #[test]
    fn test_file_and_dir_conflict() {
        assert!(Cli::try_parse_from(["mdsync", "upload", "-f", "a.md", "-d", "docs"]).is_err());
        assert!(Cli::try_parse_from(["mdsync", "upload"]).is_err());
    }
}
