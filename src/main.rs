//! # qoda CLI
//!
//! The `qoda` binary drives the qualitative coding engine: database
//! initialization, seeding pre-sectioned documents, code-rule search,
//! rule synthesis, classifier retraining, and recommendation management.
//!
//! ## Usage
//!
//! ```bash
//! qoda --config ./config/qoda.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qoda init` | Create the SQLite database and run schema migrations |
//! | `qoda seed <file>` | Load a pre-sectioned document and index it |
//! | `qoda search <doc> "<rule>"` | Evaluate a boolean code rule |
//! | `qoda rule suggest <doc> <label>` | Synthesize a rule from an example annotation |
//! | `qoda rule set <doc> <label> "<rule>"` | Store a rule on a label |
//! | `qoda rule apply <doc> <label>` | Reconcile a label's stored rule |
//! | `qoda retrain <doc>` | Retrain the classifier and reconcile suggestions |
//! | `qoda sync <doc>` | Run the annotation sync pass standalone |
//! | `qoda accept <doc> <annotation-id>` | Accept a machine suggestion |
//! | `qoda withdraw <doc>` | Withdraw all model suggestions |
//! | `qoda label add/rename/delete` | Manage the codebook |
//! | `qoda annotations <doc>` | List annotations |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use qoda::config;
use qoda::db;
use qoda::embedding::HashedNgramEmbedder;
use qoda::index::Fts5Index;
use qoda::migrate;
use qoda::reconcile::{self, ModelRefreshOutcome, Reconciler};
use qoda::rules;
use qoda::seed;
use qoda::store::sqlite::SqliteSpanStore;
use qoda::store::SpanStore;

/// qoda — a local-first qualitative coding engine with rule-based and
/// semi-supervised label suggestions.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/qoda.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "qoda",
    about = "qoda — a local-first qualitative coding engine",
    version,
    long_about = "qoda lets a coder attach categorical labels to spans of qualitative text \
    and assists by proposing further labels: boolean code rules are evaluated against a \
    per-document full-text index, and a per-document semi-supervised classifier suggests \
    labels for unannotated spans. All suggestions are reconciled against existing human work."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/qoda.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, sections, labels, annotations, recommendations,
    /// sections_fts). Idempotent.
    Init,

    /// Load a pre-sectioned document (JSON) and build its index.
    ///
    /// The seed file carries sections (conversation, attribute, text) and
    /// optionally codebook labels with stored code rules. qoda does not
    /// parse raw transcripts — sectioning happens upstream.
    Seed {
        /// Path to the seed file.
        file: PathBuf,
    },

    /// Evaluate a boolean code rule against a document.
    ///
    /// Connectives AND/OR/NOT are case-insensitive; terms support prefix
    /// wildcards (`slow*`). Results are ranked by descending score.
    Search {
        /// Document id.
        document: i64,
        /// The code rule, e.g. `"team AND (slow* OR fast*)"`.
        rule: String,
        /// Maximum number of results (all matches when omitted).
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Manage code rules.
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Retrain the document classifier and reconcile its suggestions.
    Retrain {
        /// Document id.
        document: i64,
        /// Feed rule-derived recommendations back as training positives.
        #[arg(long)]
        include_rule_recs: bool,
    },

    /// Run the annotation sync pass standalone.
    ///
    /// Purges recommendations flagged for deletion together with their
    /// annotations, then materializes any unrealized recommendations.
    Sync {
        /// Document id.
        document: i64,
    },

    /// Accept a machine suggestion as a human annotation.
    Accept {
        /// Document id.
        document: i64,
        /// Annotation id (e.g. `c-q-27-19-4031`).
        annotation_id: String,
    },

    /// Withdraw every model suggestion for a document.
    Withdraw {
        /// Document id.
        document: i64,
    },

    /// Manage the codebook.
    Label {
        #[command(subcommand)]
        action: LabelAction,
    },

    /// List a document's annotations.
    Annotations {
        /// Document id.
        document: i64,
    },
}

/// Code-rule subcommands.
#[derive(Subcommand)]
enum RuleAction {
    /// Synthesize a rule for a label from an example annotation.
    ///
    /// Combines a lexical pass (near-exact terms, AND-joined) with a
    /// semantic pass (related terms in one OR clause) and stores the
    /// result on the label.
    Suggest {
        /// Document id.
        document: i64,
        /// Label name.
        label: String,
    },

    /// Store a code rule on a label.
    Set {
        /// Document id.
        document: i64,
        /// Label name.
        label: String,
        /// The code rule.
        rule: String,
    },

    /// Evaluate a label's stored rule and reconcile the hits.
    Apply {
        /// Document id.
        document: i64,
        /// Label name.
        label: String,
        /// Maximum number of hits (all matches when omitted).
        #[arg(long)]
        limit: Option<i64>,
    },
}

/// Codebook subcommands.
#[derive(Subcommand)]
enum LabelAction {
    /// Add a label to the codebook.
    Add {
        /// Document id.
        document: i64,
        /// Label name.
        name: String,
        /// Display color.
        #[arg(long, default_value = "#888888")]
        color: String,
    },

    /// Rename a label, cascading to annotations and recommendations.
    Rename {
        /// Document id.
        document: i64,
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },

    /// Delete a label and everything referencing it.
    Delete {
        /// Document id.
        document: i64,
        /// Label name.
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let pool = db::connect(&cfg).await?;
    let store = SqliteSpanStore::new(pool.clone());
    let index = Fts5Index::new(pool.clone());

    match cli.command {
        Commands::Init => unreachable!(),
        Commands::Seed { file } => {
            let seed_doc = seed::load_seed(&file)?;
            let document_id = seed::run_seed(&cfg, &store, &index, &seed_doc).await?;
            println!("seed {}", seed_doc.name);
            println!("  document id: {}", document_id);
            println!("  sections: {}", seed_doc.sections.len());
            println!("  labels: {}", seed_doc.labels.len());
            println!("ok");
        }
        Commands::Search {
            document,
            rule,
            limit,
        } => {
            let hits = rules::search(&index, document, &rule, limit).await?;
            if hits.is_empty() {
                println!("No results.");
            } else {
                for (i, hit) in hits.iter().enumerate() {
                    println!("{}. [{:.2}] section {}", i + 1, hit.score, hit.section_id);
                    println!("    excerpt: \"{}\"", hit.highlight.replace('\n', " "));
                }
            }
        }
        Commands::Rule { action } => match action {
            RuleAction::Suggest { document, label } => {
                let embedder = HashedNgramEmbedder::default();
                let suggested = rules::suggest_rule_for_label(
                    &store,
                    document,
                    &label,
                    &embedder,
                    &cfg.suggestion,
                    &cfg.language.default,
                )
                .await?;
                match suggested {
                    Some(rule) => println!("rule for '{}': {}", label, rule),
                    None => println!("no rule could be suggested for '{}'", label),
                }
            }
            RuleAction::Set {
                document,
                label,
                rule,
            } => {
                if store.label(document, &label).await?.is_none() {
                    anyhow::bail!("no such label: {}", label);
                }
                store.set_code_rule(document, &label, &rule).await?;
                println!("rule stored on '{}'", label);
            }
            RuleAction::Apply {
                document,
                label,
                limit,
            } => {
                let outcome =
                    reconcile::refresh_rule_recommendations(&store, &index, document, &label, limit)
                        .await?;
                println!("rule apply '{}'", label);
                println!("  added: {}", outcome.reconcile.added);
                println!("  retired: {}", outcome.reconcile.retired);
                println!("  unchanged: {}", outcome.reconcile.unchanged);
                println!("  annotations written: {}", outcome.sync.materialized);
                println!("ok");
            }
        },
        Commands::Retrain {
            document,
            include_rule_recs,
        } => {
            let outcome = reconcile::refresh_model_recommendations(
                &store,
                document,
                include_rule_recs,
                &cfg.trainer,
                &cfg.language.default,
            )
            .await?;
            match outcome {
                ModelRefreshOutcome::Skipped(reason) => {
                    println!("retrain skipped: {}", reason);
                }
                ModelRefreshOutcome::Completed {
                    reconciled_labels,
                    added,
                    retired,
                    sync,
                } => {
                    println!("retrain");
                    println!("  labels reconciled: {}", reconciled_labels);
                    println!("  added: {}", added);
                    println!("  retired: {}", retired);
                    println!("  annotations written: {}", sync.materialized);
                    println!("ok");
                }
            }
        }
        Commands::Sync { document } => {
            let outcome = Reconciler::new(&store).sync_annotations(document).await?;
            println!("sync");
            println!("  purged: {}", outcome.purged);
            println!("  annotations written: {}", outcome.materialized);
            println!("ok");
        }
        Commands::Accept {
            document,
            annotation_id,
        } => {
            reconcile::accept_recommendation(&store, document, &annotation_id).await?;
            println!("accepted {}", annotation_id);
        }
        Commands::Withdraw { document } => {
            let outcome = reconcile::withdraw_model_recommendations(&store, document).await?;
            println!("withdraw");
            println!("  purged: {}", outcome.purged);
            println!("ok");
        }
        Commands::Label { action } => match action {
            LabelAction::Add {
                document,
                name,
                color,
            } => {
                store.upsert_label(document, &name, &color, None).await?;
                println!("label '{}' added", name);
            }
            LabelAction::Rename { document, from, to } => {
                store.rename_label(document, &from, &to).await?;
                println!("label '{}' renamed to '{}'", from, to);
            }
            LabelAction::Delete { document, name } => {
                store.delete_label(document, &name).await?;
                println!("label '{}' deleted", name);
            }
        },
        Commands::Annotations { document } => {
            let annotations = store.annotations(document).await?;
            if annotations.is_empty() {
                println!("No annotations.");
            } else {
                for a in &annotations {
                    let kind = if a.is_recommendation {
                        match a.confidence {
                            Some(c) => format!("machine {:.2}", c),
                            None => "machine".to_string(),
                        }
                    } else {
                        "human".to_string()
                    };
                    println!(
                        "{} [{}] {} @ {}:{}+{}",
                        a.annotation_id, kind, a.label, a.conversation, a.start, a.length
                    );
                    if let Some(ref highlight) = a.match_highlight {
                        println!("    match: {}", highlight);
                    }
                }
            }
        }
    }

    pool.close().await;
    Ok(())
}
