// src/main.rs

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use conary_core::finder::{TroveFinder, find_installed, parse_trove_spec};
use conary_core::repository::{ChangeSetJob, ChangeSetOptions};
use conary_core::{ChangeSet, CommitOptions, Config, Label, LocalDatabase, Repository};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "conary-repo")]
#[command(author, version, about = "Maintain Conary repositories and apply changesets to a root", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty repository
    Init {
        /// Repository directory
        repo: PathBuf,
    },
    /// Commit a changeset file into a repository
    Commit {
        #[arg(short, long)]
        repo: PathBuf,
        changeset: PathBuf,
        /// Keep trove digests as sent
        #[arg(long)]
        mirror: bool,
        /// Commit the troves hidden
        #[arg(long)]
        hidden: bool,
    },
    /// Build a changeset from repository contents
    Changeset {
        #[arg(short, long)]
        repo: PathBuf,
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        /// Troves to include, as name[=version][[flavor]]
        #[arg(required = true)]
        troves: Vec<String>,
    },
    /// List trove versions on a label
    List {
        #[arg(short, long)]
        repo: PathBuf,
        /// Label to list; every label when omitted
        #[arg(short, long)]
        label: Option<String>,
        names: Vec<String>,
    },
    /// Drop hidden troves and unreferenced contents
    Gc {
        #[arg(short, long)]
        repo: PathBuf,
    },
    /// Apply a changeset file to the configured root
    Apply {
        changeset: PathBuf,
        /// Take over files owned by other troves
        #[arg(long)]
        replace_files: bool,
        /// Fail on config merge conflicts
        #[arg(long)]
        strict_merge: bool,
        /// Show what would change without touching anything
        #[arg(long)]
        test: bool,
    },
    /// Install or update troves from a repository with their requirements
    Update {
        #[arg(short, long)]
        repo: PathBuf,
        /// Troves to update, as name[=version][[flavor]]
        #[arg(required = true)]
        troves: Vec<String>,
    },
    /// Undo the most recent update
    Rollback,
    /// Show installed troves
    Query {
        /// name[=version]
        spec: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Init { repo } => {
            Repository::init(&repo).with_context(|| format!("Failed to create repository at {}", repo.display()))?;
            println!("Repository initialized at {}", repo.display());
        }
        Commands::Commit {
            repo,
            changeset,
            mirror,
            hidden,
        } => {
            let mut repo = open_repo(&repo)?;
            let cs = ChangeSet::read_from(&changeset)
                .with_context(|| format!("Failed to read {}", changeset.display()))?;
            let committed = repo.commit_change_set(&cs, CommitOptions { mirror, hidden })?;
            for tuple in &committed {
                println!("committed {}", tuple);
            }
        }
        Commands::Changeset { repo, output, troves } => {
            let repo = open_repo(&repo)?;
            let finder = TroveFinder::new(&repo, config.install_label_path()?, config.flavor_context()?);
            let mut jobs = Vec::new();
            for spec in &troves {
                for tuple in finder.find_spec(spec)? {
                    jobs.push(ChangeSetJob::install(&tuple));
                }
            }
            let result = repo.create_change_set(&jobs, ChangeSetOptions::default())?;
            let size = result.change_set.write_to(&output)?;
            println!("wrote {} ({} bytes)", output.display(), size);
        }
        Commands::List { repo, label, names } => {
            let repo = open_repo(&repo)?;
            let label = label.as_deref().map(Label::parse).transpose()?;
            for (name, versions) in repo.get_trove_version_list(label.as_ref(), &names)? {
                for (version, flavors) in versions {
                    for flavor in flavors {
                        println!("{}={}[{}]", name, version, flavor);
                    }
                }
            }
        }
        Commands::Gc { repo } => {
            let mut repo = open_repo(&repo)?;
            let stats = repo.gc()?;
            println!(
                "removed {} instances, {} file streams, {} blobs",
                stats.instances, stats.streams, stats.blobs
            );
        }
        Commands::Apply {
            changeset,
            replace_files,
            strict_merge,
            test,
        } => {
            let mut db = open_local(&config)?;
            let cs = ChangeSet::read_from(&changeset)
                .with_context(|| format!("Failed to read {}", changeset.display()))?;
            let mut opts = config.update_options();
            opts.replace_files = replace_files;
            opts.strict_merge = strict_merge;
            opts.test = test;

            let job = conary_core::apply_change_set(&mut db, &cs, &opts)?;
            if test {
                println!("{}", serde_json::to_string_pretty(job.fs_ops())?);
                return Ok(());
            }
            for tuple in &job.removed {
                println!("removed {}", tuple);
            }
            for tuple in &job.installed {
                println!("installed {}", tuple);
            }
            for path in &job.conflicts {
                println!("warning: merge conflicts left in {}.conflicts", path);
            }
        }
        Commands::Update { repo, troves } => {
            let repo = open_repo(&repo)?;
            let mut db = open_local(&config)?;
            let finder = TroveFinder::new(&repo, config.install_label_path()?, config.flavor_context()?);
            let mut tuples = Vec::new();
            for spec in &troves {
                tuples.extend(finder.find_spec(spec)?);
            }
            let job = conary_core::update_from_repository(&repo, &mut db, &config, &tuples)?;
            for tuple in &job.removed {
                println!("removed {}", tuple);
            }
            for tuple in &job.installed {
                println!("installed {}", tuple);
            }
            for path in &job.conflicts {
                println!("warning: merge conflicts left in {}.conflicts", path);
            }
        }
        Commands::Rollback => {
            let mut db = open_local(&config)?;
            if db.rollback_count() == 0 {
                bail!("No rollbacks available");
            }
            let job = db.rollback_one()?;
            info!("rolled back {} trove change(s)", job.installed.len() + job.removed.len());
            println!("{} rollback(s) left", db.rollback_count());
        }
        Commands::Query { spec } => {
            let db = open_local(&config)?;
            let tuples = match spec {
                Some(spec) => {
                    let (name, version, _) = parse_trove_spec(&spec)?;
                    find_installed(&db, &name, version.as_deref())?
                }
                None => db.installed()?,
            };
            for tuple in tuples {
                println!("{}", tuple);
            }
        }
    }
    Ok(())
}

fn open_repo(path: &Path) -> Result<Repository> {
    Repository::open(path).with_context(|| format!("Failed to open repository at {}", path.display()))
}

fn open_local(config: &Config) -> Result<LocalDatabase> {
    LocalDatabase::open(&config.db_path, &config.root)
        .with_context(|| format!("Failed to open local database at {}", config.db_path.display()))
}
