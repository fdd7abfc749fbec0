// QuillDB
// Copyright (C) 2025 QuillDB contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! QuillDB CLI Tool
//!
//! Command-line interface for a QuillDB database directory.

use clap::{Parser, Subcommand};
use quilldb_core::{Database, Document, Value};
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "quilldb")]
#[command(about = "QuillDB - embedded document database CLI")]
#[command(version = "0.1.0")]
struct Cli {
    /// Data directory (defaults to the XDG data directory)
    #[arg(long, short = 'd', global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert a JSON document into a collection
    Put {
        /// Collection name
        collection: String,
        /// JSON document content
        json: String,
        /// Explicit document id (random UUID when omitted)
        #[arg(long)]
        id: Option<String>,
    },
    /// Get a document by id from a collection
    Get {
        collection: String,
        id: String,
    },
    /// Update a document by id
    Update {
        collection: String,
        id: String,
        /// New JSON document content
        json: String,
    },
    /// Delete a document by id
    Delete {
        collection: String,
        id: String,
    },
    /// List all document ids in a collection
    List {
        collection: String,
    },
    /// List all collections
    Collections,
    /// Count documents in a collection
    Count {
        collection: String,
    },
    /// Find documents by field value
    Find {
        collection: String,
        /// Field name
        field: String,
        /// Field value (JSON)
        value: String,
    },
    /// Print engine statistics
    Stats,
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let data_dir = data_directory(cli.data_dir);

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!("failed to create data directory {}: {}", data_dir.display(), e);
        process::exit(1);
    }

    let db = match Database::open(data_dir.join("quill.db")) {
        Ok(db) => db,
        Err(e) => {
            error!("failed to open database: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Put { collection, json, id } => handle_put(&db, &collection, &json, id),
        Commands::Get { collection, id } => handle_get(&db, &collection, &id),
        Commands::Update { collection, id, json } => handle_update(&db, &collection, &id, &json),
        Commands::Delete { collection, id } => handle_delete(&db, &collection, &id),
        Commands::List { collection } => handle_list(&db, &collection),
        Commands::Collections => handle_collections(&db),
        Commands::Count { collection } => handle_count(&db, &collection),
        Commands::Find { collection, field, value } => handle_find(&db, &collection, &field, &value),
        Commands::Stats => handle_stats(&db),
    };

    if let Err(e) = result {
        error!("command failed: {e}");
        process::exit(1);
    }
}

/// XDG-compliant data directory fallback chain
fn data_directory(custom: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = custom {
        return dir;
    }

    if let Ok(xdg_data_home) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg_data_home).join("quilldb")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local").join("share").join("quilldb")
    } else {
        PathBuf::from(".quilldb")
    }
}

fn handle_put(db: &Database, collection: &str, json: &str, id: Option<String>) -> anyhow::Result<()> {
    let content: JsonValue = serde_json::from_str(json)?;

    let document = match id {
        Some(id) => Document::from_json(id, content)?,
        None => Document::from_json(quilldb_core::DocumentId::new().0, content)?,
    };

    let id = db.collection(collection)?.insert(document)?;
    println!("Document inserted with id: {id}");
    info!("inserted document {} into collection {}", id, collection);
    Ok(())
}

fn handle_get(db: &Database, collection: &str, id: &str) -> anyhow::Result<()> {
    match db.collection(collection)?.find_by_id(id) {
        Some(document) => {
            println!("{}", serde_json::to_string_pretty(&document.to_json())?);
            info!("retrieved document {} from collection {}", id, collection);
        }
        None => println!("Document not found"),
    }
    Ok(())
}

fn handle_update(db: &Database, collection: &str, id: &str, json: &str) -> anyhow::Result<()> {
    let content: JsonValue = serde_json::from_str(json)?;
    let fields = match Value::from(content) {
        Value::Object(fields) => fields,
        _ => anyhow::bail!("the document content must be a JSON object"),
    };

    if db.collection(collection)?.update(id, fields)? {
        println!("Document updated: {id}");
        info!("updated document {} in collection {}", id, collection);
    } else {
        println!("Document not found: {id}");
    }
    Ok(())
}

fn handle_delete(db: &Database, collection: &str, id: &str) -> anyhow::Result<()> {
    if db.collection(collection)?.delete(id)? {
        println!("Document deleted: {id}");
        info!("deleted document {} from collection {}", id, collection);
    } else {
        println!("Document not found: {id}");
    }
    Ok(())
}

fn handle_list(db: &Database, collection: &str) -> anyhow::Result<()> {
    let ids = db.collection(collection)?.list_ids();
    if ids.is_empty() {
        println!("No documents found in collection '{collection}'");
    } else {
        println!("Documents in collection '{collection}':");
        for id in &ids {
            println!("  {id}");
        }
    }
    info!("listed {} documents in collection {}", ids.len(), collection);
    Ok(())
}

fn handle_collections(db: &Database) -> anyhow::Result<()> {
    let names = db.collection_names();
    if names.is_empty() {
        println!("No collections found");
    } else {
        println!("Collections:");
        for name in &names {
            println!("  {name}");
        }
    }
    Ok(())
}

fn handle_count(db: &Database, collection: &str) -> anyhow::Result<()> {
    let count = db.collection(collection)?.count();
    println!("Documents in collection '{collection}': {count}");
    Ok(())
}

fn handle_find(db: &Database, collection: &str, field: &str, value: &str) -> anyhow::Result<()> {
    let value = Value::from(serde_json::from_str::<JsonValue>(value)?);

    let matches = db.collection(collection)?.find_by_field(field, &value)?;
    if matches.is_empty() {
        println!("No documents found matching {field}={value}");
    } else {
        println!("Found {} documents matching {field}={value}:", matches.len());
        for document in matches {
            println!("  {}: {}", document.id, serde_json::to_string(&document.to_json())?);
        }
    }
    Ok(())
}

fn handle_stats(db: &Database) -> anyhow::Result<()> {
    let stats = db.stats();
    println!("Collections:          {}", stats.collections);
    println!("Active transactions:  {}", stats.active_transactions);
    println!("Locks granted:        {}", stats.locks.granted);
    println!("Lock waiters:         {}", stats.locks.waiting);
    println!("Deadlocks detected:   {}", stats.deadlocks.deadlocks_detected);
    println!("Version chains:       {}", stats.versions.chains);
    println!("Versions held:        {}", stats.versions.versions);
    println!("Page cache hits:      {}", stats.page_cache.hits);
    println!("Page cache misses:    {}", stats.page_cache.misses);
    println!("WAL records written:  {}", stats.wal.records_written);
    println!("WAL last LSN:         {}", stats.wal.last_lsn);
    Ok(())
}
