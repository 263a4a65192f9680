use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use kennel::{
    Store,
    schema::SchemaPlan,
    search::{SearchConfig, SearchIndexManager},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kennel", version, about = "Kennel schema and search provisioning")]
struct Cli {
    /// Postgres connection string. Falls back to DATABASE_URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Schema holding the collections (default: public)
    #[arg(long, default_value = "public")]
    schema: String,

    /// Collections to manage (repeatable)
    #[arg(long = "collection", action = ArgAction::Append)]
    collections: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show planned DDL changes without applying
    SchemaPlan,

    /// Apply DDL changes (create schema, collection tables, triggers and indexes)
    SchemaSync,

    /// Create the search indexes declared in a config file that do not exist yet
    SearchEnsure { config: PathBuf },

    /// List search indexes of a collection
    SearchList { collection: String },

    /// Drop one search index
    SearchDrop { collection: String, name: String },

    /// Replace the synonym corpus with the groups in a config file
    SynonymsLoad { config: PathBuf },
}

#[tokio::main]
async fn main() -> kennel::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let Some(url) = cli.database_url else {
        eprintln!("error: --database-url or env DATABASE_URL is required");
        std::process::exit(2);
    };

    let config = match &cli.command {
        Commands::SearchEnsure { config } | Commands::SynonymsLoad { config } => {
            Some(SearchConfig::from_path(config)?)
        }
        _ => None,
    };

    let mut builder = Store::builder(&url)
        .schema(cli.schema.trim())
        .collections(cli.collections.iter().map(|c| c.trim().to_string()));
    if let Some(config) = &config {
        builder = builder
            .synonyms_collection(&config.synonyms_collection)
            .collections(config.indexes.iter().map(|i| i.collection.clone()));
    }
    let store = builder.build().await?;

    match cli.command {
        Commands::SchemaPlan => {
            let plan = store.schema().plan(&store.schema_config()).await?;
            print_plan(&plan);
        }
        Commands::SchemaSync => {
            let plan = store.schema().sync(&store.schema_config()).await?;
            if plan.is_empty() {
                println!("No changes needed.");
            } else {
                println!("Applied changes:");
                print_plan(&plan);
            }
        }
        Commands::SearchEnsure { .. } => {
            let config = config.unwrap_or_default();
            let report = manager(&store, &config).ensure_indexes(&config.indexes).await?;
            for name in &report.created {
                println!("created  {name}");
            }
            for name in &report.skipped {
                println!("skipped  {name}");
            }
        }
        Commands::SearchList { collection } => {
            let indexes = store.search().list_indexes(&collection).await?;
            if indexes.is_empty() {
                println!("No search indexes on {collection}.");
            }
            for index in indexes {
                let state = if index.queryable {
                    "ready"
                } else if index.needs_rebuild {
                    "failed"
                } else {
                    "building"
                };
                println!("{}\t{}\t{state}", index.name, index.kind.as_str());
            }
        }
        Commands::SearchDrop { collection, name } => {
            store.search().drop_index(&collection, &name).await?;
            println!("Dropped {name} (if present).");
        }
        Commands::SynonymsLoad { .. } => {
            let config = config.unwrap_or_default();
            let written = manager(&store, &config)
                .provision_synonyms(&config.synonyms)
                .await?;
            println!("Wrote {written} synonym groups.");
        }
    }

    Ok(())
}

fn manager(store: &Store, config: &SearchConfig) -> SearchIndexManager {
    store
        .search()
        .with_synonyms_collection(&config.synonyms_collection)
}

fn print_plan(plan: &SchemaPlan) {
    if !plan.warnings().is_empty() {
        eprintln!("Warnings ({}):", plan.warnings().len());
        for w in plan.warnings() {
            eprintln!("  - {}", w);
        }
    }

    if plan.actions().is_empty() {
        println!("No pending DDL actions.");
        return;
    }

    println!("DDL actions ({}):", plan.actions().len());
    for (i, action) in plan.actions().iter().enumerate() {
        println!("{}. {}", i + 1, action.description());
        println!("{}\n", action.sql());
    }
}
