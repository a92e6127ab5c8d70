//! # bitdex CLI (`bdx`)
//!
//! The `bdx` binary drives a bitdex engine from the shell. Every command
//! opens the engine from the configured database, runs, and writes the
//! snapshot back before exiting. Results are printed to stdout as JSON;
//! logs go to stderr and are controlled by `BITDEX_LOG`.
//!
//! ## Usage
//!
//! ```bash
//! bdx --config ./config/bitdex.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bdx init` | Create the SQLite database and schema |
//! | `bdx put <file>` | Insert a document |
//! | `bdx get <id>` | Print a document (or its stored body) |
//! | `bdx update <id> <patch>` | Merge a patch into a document |
//! | `bdx rm <id>` | Remove a document and its body blobs |
//! | `bdx find` | Query by context, feature and filter labels |
//! | `bdx version <id> <patch>` | Create a new version of a document |
//! | `bdx blob ...` | Raw blob storage |
//! | `bdx tree ...` | Context tree paths |
//! | `bdx layer ...` | Context layers |
//! | `bdx backends` | Configured backends and their status |
//! | `bdx stats` | Engine statistics |
//!
//! ## Examples
//!
//! ```bash
//! bdx init
//! bdx put note.json --context /projects/reports --feature draft
//! bdx find --context /projects --filter thisWeek --limit 20
//! bdx tree mv /projects/reports /archive --recursive
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bitdex::config::{self, Config};
use bitdex::content_store::GetOptions;
use bitdex::stats;
use bitdex::Engine;
use bitdex_core::index::RemoveOutcome;
use bitdex_core::tree::{LayerKind, LayerUpdate};
use bitdex_core::{Checksum, Document, DocumentPatch, FindOptions, LabelQuery};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;

/// bitdex CLI: a local-first document index with content-addressed blob
/// storage.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/bitdex.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "bdx",
    about = "bitdex: a local-first document index with content-addressed blob storage",
    version,
    long_about = "bitdex files JSON documents under context paths and feature labels, \
    answers label queries with roaring-bitmap set algebra, and stores each document body \
    as a checksum-addressed blob on one or more backends (sqlite, filesystem, S3)."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/bitdex.toml`. A missing file means built-in
    /// defaults.
    #[arg(long, global = true, default_value = "./config/bitdex.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Insert a document.
    ///
    /// The file holds a document as JSON (`-` reads stdin). With `--raw`
    /// the whole file is the document's `data` payload instead.
    Put {
        file: PathBuf,

        /// Treat the file as the data payload of a new document.
        #[arg(long)]
        raw: bool,

        /// Schema of a `--raw` document.
        #[arg(long, default_value = "document")]
        schema: String,

        /// Context path to file the document under (repeatable).
        #[arg(long = "context")]
        contexts: Vec<String>,

        /// Feature label (repeatable).
        #[arg(long = "feature")]
        features: Vec<String>,

        /// Backend to store the body on (repeatable; defaults from config).
        #[arg(long = "backend")]
        backends: Vec<String>,
    },

    /// Print a document by id.
    Get {
        id: u32,

        /// Print the stored body read back from the backends.
        #[arg(long)]
        body: bool,

        /// Confirm cached bodies against a backend.
        #[arg(long)]
        strict: bool,
    },

    /// Merge a JSON patch file into a document.
    Update {
        id: u32,
        patch: PathBuf,

        /// Replace the document's context paths (repeatable).
        #[arg(long = "context")]
        contexts: Vec<String>,

        #[arg(long = "backend")]
        backends: Vec<String>,
    },

    /// Remove a document.
    Rm {
        id: u32,

        /// Leave body blobs on the backends.
        #[arg(long)]
        keep_blobs: bool,
    },

    /// Find documents by labels.
    ///
    /// Labels within one flag kind are OR-ed, kinds are AND-ed, and a
    /// leading `!` excludes. Context paths match their whole subtree.
    /// Filters accept `today`, `yesterday`, `thisWeek`, `thisMonth` and
    /// `thisYear`, optionally prefixed with `created:` or `updated:`.
    Find {
        #[arg(long = "context")]
        contexts: Vec<String>,

        #[arg(long = "feature")]
        features: Vec<String>,

        #[arg(long = "filter")]
        filters: Vec<String>,

        /// Maximum number of documents (0 = no limit).
        #[arg(long, default_value_t = 0)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Print only the ids.
        #[arg(long)]
        ids: bool,
    },

    /// Create a new version of a document from a JSON patch file.
    Version {
        parent_id: u32,
        patch: PathBuf,

        #[arg(long = "backend")]
        backends: Vec<String>,
    },

    /// Raw blob storage.
    Blob {
        #[command(subcommand)]
        action: BlobAction,
    },

    /// Context tree paths.
    Tree {
        #[command(subcommand)]
        action: TreeAction,
    },

    /// Context layers.
    Layer {
        #[command(subcommand)]
        action: LayerAction,
    },

    /// List configured backends and their status.
    Backends,

    /// Show engine statistics.
    Stats {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum BlobAction {
    /// Store a file.
    Put {
        file: PathBuf,
        #[arg(long)]
        content_type: Option<String>,
        #[arg(long = "backend")]
        backends: Vec<String>,
    },
    /// Fetch a blob (`<algorithm>:<digest>`).
    Get {
        checksum: String,
        /// Write to this file instead of stdout.
        #[arg(long, short)]
        out: Option<PathBuf>,
        #[arg(long = "backend")]
        backends: Vec<String>,
        #[arg(long)]
        strict: bool,
    },
    /// Whether a blob exists.
    Has {
        checksum: String,
        #[arg(long = "backend")]
        backends: Vec<String>,
    },
    /// Size and metadata of a blob.
    Stat {
        checksum: String,
        #[arg(long = "backend")]
        backends: Vec<String>,
    },
    /// Delete a blob.
    Rm {
        checksum: String,
        #[arg(long = "backend")]
        backends: Vec<String>,
    },
    /// List the blobs held by one backend.
    Ls { backend: String },
}

#[derive(Subcommand)]
enum TreeAction {
    /// Print the tree as JSON.
    Show,
    /// List every path.
    Paths,
    /// Show one node.
    Node { path: String },
    /// Create a path and any missing ancestors.
    Mkdir { path: String },
    /// Move a node under a new parent.
    Mv {
        from: String,
        to_parent: String,
        /// Move the whole subtree; otherwise children stay behind.
        #[arg(long)]
        recursive: bool,
    },
    /// Copy a subtree, documents included, under a new parent.
    Cp { from: String, to_parent: String },
    /// Remove a node.
    Rm {
        path: String,
        #[arg(long)]
        recursive: bool,
        /// Remove even when documents are filed there.
        #[arg(long)]
        force: bool,
    },
    /// Lock the layer at the end of a path.
    Lock { path: String },
    /// Unlock the layer at the end of a path.
    Unlock { path: String },
}

#[derive(Subcommand)]
enum LayerAction {
    List,
    Show {
        name: String,
    },
    Create {
        name: String,
        /// `context`, `canvas` or `label`.
        #[arg(long, default_value = "context")]
        kind: String,
    },
    Rename {
        name: String,
        new_name: String,
    },
    Update {
        name: String,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        color: Option<String>,
    },
    Lock {
        name: String,
    },
    Unlock {
        name: String,
    },
    /// Grant `permission` on a layer to `principal`.
    Acl {
        name: String,
        principal: String,
        permission: String,
    },
    /// Revoke a principal's entry.
    RmAcl {
        name: String,
        principal: String,
    },
    Delete {
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BITDEX_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "bdx", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = load_or_default(&cli.config)?;
    let engine = Engine::open(cfg).await?;
    let result = run(&engine, cli.command).await;
    engine.shutdown().await?;
    result
}

/// A missing config file means defaults; a malformed one is an error.
fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::minimal())
    }
}

async fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            println!("Database initialized successfully.");
        }
        Commands::Put {
            file,
            raw,
            schema,
            contexts,
            features,
            backends,
        } => {
            let value = read_json(&file)?;
            let doc = if raw {
                engine.new_document(&schema, value)
            } else {
                parse_document(engine, value)?
            };
            let outcome = engine
                .insert_document(doc, &contexts, &features, &backends)
                .await?;
            print_json(&outcome)?;
        }
        Commands::Get { id, body, strict } => {
            if body {
                print_json(&engine.get_document_body(id, GetOptions { strict }).await?)?;
            } else {
                print_json(&engine.get_document(id)?)?;
            }
        }
        Commands::Update {
            id,
            patch,
            contexts,
            backends,
        } => {
            let mut patch = read_patch(&patch)?;
            if !contexts.is_empty() {
                patch.contexts = Some(contexts);
            }
            print_json(&engine.update_document(id, &patch, &backends).await?)?;
        }
        Commands::Rm { id, keep_blobs } => match engine.remove_document(id, !keep_blobs).await? {
            RemoveOutcome::Removed(doc) => print_json(&doc)?,
            RemoveOutcome::AlreadyRemoved => println!("Document {} was already removed.", id),
        },
        Commands::Find {
            contexts,
            features,
            filters,
            limit,
            offset,
            ids,
        } => {
            let query = LabelQuery {
                contexts,
                features,
                filters,
            };
            let result = engine.find_documents(&query, FindOptions::page(limit, offset))?;
            if ids {
                for doc in &result.documents {
                    println!("{}", doc.id);
                }
            } else {
                print_json(&result)?;
            }
        }
        Commands::Version {
            parent_id,
            patch,
            backends,
        } => {
            let patch = read_patch(&patch)?;
            let outcome = engine.create_version(parent_id, &patch, &backends).await?;
            print_json(&engine.get_document(outcome.id)?)?;
        }
        Commands::Blob { action } => run_blob(engine, action).await?,
        Commands::Tree { action } => run_tree(engine, action)?,
        Commands::Layer { action } => run_layer(engine, action)?,
        Commands::Backends => {
            print_json(&engine.store().list_backends())?;
        }
        Commands::Stats { json } => {
            let s = stats::collect(engine);
            if json {
                print_json(&s)?;
            } else {
                stats::print_stats(&s);
            }
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }
    Ok(())
}

async fn run_blob(engine: &Engine, action: BlobAction) -> Result<()> {
    match action {
        BlobAction::Put {
            file,
            content_type,
            backends,
        } => {
            let receipt = engine
                .insert_file(&file, content_type.as_deref(), &backends)
                .await?;
            print_json(&receipt)?;
        }
        BlobAction::Get {
            checksum,
            out,
            backends,
            strict,
        } => {
            let checksum: Checksum = checksum.parse()?;
            let options = GetOptions { strict };
            match out {
                Some(dest) => {
                    let written = engine.get_file(&checksum, &dest, &backends, options).await?;
                    eprintln!("Wrote {} to {}", stats::format_bytes(written), dest.display());
                }
                None => {
                    use std::io::Write;
                    let bytes = engine.get_blob(&checksum, &backends, options).await?;
                    std::io::stdout().write_all(&bytes)?;
                }
            }
        }
        BlobAction::Has { checksum, backends } => {
            let checksum: Checksum = checksum.parse()?;
            println!("{}", engine.has_blob(&checksum, &backends).await?);
        }
        BlobAction::Stat { checksum, backends } => {
            let checksum: Checksum = checksum.parse()?;
            print_json(&engine.stat_blob(&checksum, &backends).await?)?;
        }
        BlobAction::Rm { checksum, backends } => {
            let checksum: Checksum = checksum.parse()?;
            print_json(&engine.delete_blob(&checksum, &backends).await?)?;
        }
        BlobAction::Ls { backend } => {
            for checksum in engine.store().list(&backend).await? {
                println!("{}", checksum);
            }
        }
    }
    Ok(())
}

fn run_tree(engine: &Engine, action: TreeAction) -> Result<()> {
    match action {
        TreeAction::Show => print_json(&engine.context_tree())?,
        TreeAction::Paths => {
            for path in engine.context_paths() {
                println!("{}", path);
            }
        }
        TreeAction::Node { path } => print_json(&engine.get_context(&path)?)?,
        TreeAction::Mkdir { path } => print_json(&engine.insert_context(&path)?)?,
        TreeAction::Mv {
            from,
            to_parent,
            recursive,
        } => {
            let to = engine.move_context(&from, &to_parent, recursive)?;
            println!("{}", to);
        }
        TreeAction::Cp { from, to_parent } => {
            let copied = engine.copy_context(&from, &to_parent)?;
            println!("Copied {} memberships.", copied);
        }
        TreeAction::Rm {
            path,
            recursive,
            force,
        } => print_json(&engine.remove_context(&path, recursive, force)?)?,
        TreeAction::Lock { path } => {
            let layer = engine.get_context(&path)?.layer.name;
            print_json(&engine.lock_layer(&layer)?)?
        }
        TreeAction::Unlock { path } => {
            let layer = engine.get_context(&path)?.layer.name;
            print_json(&engine.unlock_layer(&layer)?)?
        }
    }
    Ok(())
}

fn run_layer(engine: &Engine, action: LayerAction) -> Result<()> {
    match action {
        LayerAction::List => print_json(&engine.list_layers())?,
        LayerAction::Show { name } => print_json(&engine.get_layer(&name)?)?,
        LayerAction::Create { name, kind } => {
            print_json(&engine.create_layer(&name, parse_layer_kind(&kind)?)?)?
        }
        LayerAction::Rename { name, new_name } => {
            print_json(&engine.rename_layer(&name, &new_name)?)?
        }
        LayerAction::Update {
            name,
            label,
            description,
            color,
        } => {
            let update = LayerUpdate {
                label,
                description,
                color,
            };
            print_json(&engine.update_layer(&name, &update)?)?
        }
        LayerAction::Lock { name } => print_json(&engine.lock_layer(&name)?)?,
        LayerAction::Unlock { name } => print_json(&engine.unlock_layer(&name)?)?,
        LayerAction::Acl {
            name,
            principal,
            permission,
        } => print_json(&engine.set_layer_acl(&name, &principal, &permission)?)?,
        LayerAction::RmAcl { name, principal } => {
            print_json(&engine.remove_layer_acl(&name, &principal)?)?
        }
        LayerAction::Delete { name } => {
            engine.delete_layer(&name)?;
            println!("Layer '{}' deleted.", name);
        }
    }
    Ok(())
}

fn parse_layer_kind(kind: &str) -> Result<LayerKind> {
    match kind {
        "context" => Ok(LayerKind::Context),
        "canvas" => Ok(LayerKind::Canvas),
        "label" => Ok(LayerKind::Label),
        other => bail!("unknown layer kind '{}' (expected context, canvas or label)", other),
    }
}

/// Read JSON from a file, or from stdin when the path is `-`.
fn read_json(path: &Path) -> Result<serde_json::Value> {
    let text = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
    };
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn read_patch(path: &Path) -> Result<DocumentPatch> {
    let value = read_json(path)?;
    serde_json::from_value(value)
        .with_context(|| format!("{} is not a document patch", path.display()))
}

/// Documents without an `index` section take the configured checksum
/// options.
fn parse_document(engine: &Engine, value: serde_json::Value) -> Result<Document> {
    let has_index = value.get("index").is_some();
    let mut doc: Document =
        serde_json::from_value(value).context("Input is not a document")?;
    if !has_index {
        doc.index = engine.config().index.document_options();
    }
    Ok(doc)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
