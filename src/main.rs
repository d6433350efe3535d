// src/main.rs

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use conary_repository::changeset::ChangeSet;
use conary_repository::flavor::Flavor;
use conary_repository::hash::Sha1Digest;
use conary_repository::repository::{
    ChangeSetJob, CommitOptions, Repository, RepositoryConfig,
};
use conary_repository::version::Version;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "conary-repos")]
#[command(author, version, about = "Conary repository: trove changesets and transactional commits", long_about = None)]
struct Cli {
    #[command(flatten)]
    repo: RepoArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RepoArgs {
    /// Repository configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Trove database path, overrides the configuration
    #[arg(short, long, global = true)]
    db_path: Option<PathBuf>,

    /// Content store directory, overrides the configuration
    #[arg(long, global = true)]
    contents_dir: Option<PathBuf>,

    /// Host this repository serves (repeatable), overrides the configuration
    #[arg(long = "server-name", global = true)]
    server_names: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the trove database and content store
    Init,
    /// Commit a changeset file
    Commit {
        /// Changeset file to commit
        file: PathBuf,
        /// Keep source timestamps (replicating another repository)
        #[arg(long)]
        mirror: bool,
        /// Require trusted signatures on every trove
        #[arg(long)]
        require_signatures: bool,
    },
    /// Print the troves in a changeset file
    Show {
        /// Changeset file to show
        file: PathBuf,
    },
    /// Write a changeset for a trove to a file
    Export {
        /// Trove name
        name: String,
        /// Trove version
        version: String,
        /// Trove flavor
        #[arg(short, long, default_value = "")]
        flavor: String,
        /// Build a relative changeset from this version
        #[arg(long)]
        from: Option<String>,
        /// Include no old versions for member troves and files
        #[arg(long)]
        absolute: bool,
        /// Leave member troves out
        #[arg(long)]
        no_recurse: bool,
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List troves in the repository
    List {
        /// Trove name (optional, shows all if omitted)
        name: Option<String>,
    },
    /// Write stored contents to stdout
    Cat {
        /// Content digest (hex)
        sha1: String,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

impl RepoArgs {
    fn load(&self) -> Result<RepositoryConfig> {
        let mut config = match &self.config {
            Some(path) => RepositoryConfig::load(path)
                .with_context(|| format!("reading configuration {}", path.display()))?,
            None => RepositoryConfig::new(Vec::new()),
        };
        if let Some(db_path) = &self.db_path {
            config.db_path = db_path.clone();
        }
        if let Some(contents_dir) = &self.contents_dir {
            config.contents_dir = contents_dir.clone();
        }
        if !self.server_names.is_empty() {
            config.server_names = self.server_names.clone();
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let config = cli.repo.load()?;
            if config.server_names.is_empty() {
                anyhow::bail!("at least one --server-name is required");
            }
            info!("Initializing repository at: {}", config.db_path.display());
            Repository::init(config.clone())?;
            println!(
                "Repository initialized at: {} (contents in {})",
                config.db_path.display(),
                config.contents_dir.display()
            );
            Ok(())
        }
        Commands::Commit {
            file,
            mirror,
            require_signatures,
        } => {
            let mut repo = Repository::open(cli.repo.load()?)?;
            let cs = ChangeSet::read_file(&file)
                .with_context(|| format!("reading changeset {}", file.display()))?;
            let options = CommitOptions {
                require_signatures,
                mirror,
                ..Default::default()
            };
            let summary = repo.commit_change_set(&cs, &options)?;
            for key in &summary.added {
                println!("Committed {}", key);
            }
            for key in &summary.removed {
                println!("Removed {}", key);
            }
            println!(
                "  Contents: {} stored, {} already present, {} removed",
                summary.blobs_stored, summary.blobs_deduplicated, summary.blobs_removed
            );
            Ok(())
        }
        Commands::Show { file } => {
            let cs = ChangeSet::read_file(&file)
                .with_context(|| format!("reading changeset {}", file.display()))?;
            for trove in cs.iter_new_troves() {
                match trove.old_version() {
                    Some(old) => println!("{}[{}]: {} -> {}", trove.name(), trove.flavor(), old, trove.new_version()),
                    None => println!("{}={}[{}]", trove.name(), trove.new_version(), trove.flavor()),
                }
                println!(
                    "  Files: {} new, {} changed, {} removed",
                    trove.new_files().len(),
                    trove.changed_files().len(),
                    trove.old_files().len()
                );
                for (name, delta) in trove.iter_trove_changes() {
                    println!("  {}{}={}[{}]", delta.op.as_char(), name, delta.version, delta.flavor);
                }
                if !trove.requires().is_empty() {
                    println!("  Requires: {}", trove.requires());
                }
                if !trove.provides().is_empty() {
                    println!("  Provides: {}", trove.provides());
                }
            }
            for key in cs.iter_old_troves() {
                println!("Remove {}", key);
            }
            println!("  File contents: {}", cs.iter_contents().count());
            Ok(())
        }
        Commands::Export {
            name,
            version,
            flavor,
            from,
            absolute,
            no_recurse,
            output,
        } => {
            let repo = Repository::open(cli.repo.load()?)?;
            let version: Version = version.parse()?;
            let flavor: Flavor = flavor.parse()?;
            let job = match from {
                Some(old) => {
                    let mut job = ChangeSetJob::update(&name, old.parse()?, version, flavor);
                    job.absolute = absolute;
                    job
                }
                None => ChangeSetJob::install(&name, version, flavor),
            };
            let created = repo.create_change_set(&[job], !no_recurse, true)?;
            for external in &created.external {
                println!("Skipped {} (served by another repository)", external.name);
            }
            created.change_set.write_file(&output)?;
            println!(
                "Wrote {} troves to {}",
                created.change_set.new_trove_count(),
                output.display()
            );
            Ok(())
        }
        Commands::List { name } => {
            let repo = Repository::open(cli.repo.load()?)?;
            let keys = repo.list_troves(name.as_deref())?;
            if keys.is_empty() {
                println!("No troves found.");
            } else {
                println!("Troves in repository:");
                for key in &keys {
                    println!("  {}", key);
                }
                println!("\nTotal: {} trove(s)", keys.len());
            }
            Ok(())
        }
        Commands::Cat { sha1 } => {
            let repo = Repository::open(cli.repo.load()?)?;
            let digest: Sha1Digest = sha1.parse()?;
            let data = repo.contents(&digest)?;
            std::io::stdout().write_all(&data)?;
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "conary-repos", &mut std::io::stdout());
            Ok(())
        }
    }
}
