//! sqlbridge CLI
//!
//! Command-line tools over the native SQLite bridge.
//!
//! # Commands
//!
//! - `exec` - Run a SQL script
//! - `query` - Run one statement and print its rows
//! - `columns` - Describe the result columns of a statement
//! - `backup` - Copy a database to a file with the online backup API
//! - `restore` - Load a database file into another database

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Command-line tools for the SQLite native bridge.
#[derive(Parser)]
#[command(name = "sqlbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database file (`:memory:` and `file:` URIs accepted)
    #[arg(global = true, short, long)]
    path: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a SQL script
    Exec {
        /// SQL text; may hold several statements
        sql: String,
    },

    /// Run one statement and print its rows
    Query {
        /// SQL text of a single statement
        sql: String,

        /// Maximum number of rows to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Describe the result columns of a statement
    Columns {
        /// SQL text of a single statement
        sql: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Copy a database to a file
    Backup {
        /// Destination file
        output: PathBuf,

        /// Schema to copy
        #[arg(short, long, default_value = "main")]
        schema: String,
    },

    /// Load a database file into the database at --path
    Restore {
        /// Source file
        input: PathBuf,

        /// Schema to replace
        #[arg(short, long, default_value = "main")]
        schema: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Exec { sql } => {
            let path = cli.path.ok_or("Database path required for exec")?;
            commands::exec::run(&path, &sql)?;
        }
        Commands::Query { sql, limit, format } => {
            let path = cli.path.ok_or("Database path required for query")?;
            commands::query::run(&path, &sql, limit, &format)?;
        }
        Commands::Columns { sql, format } => {
            let path = cli.path.ok_or("Database path required for columns")?;
            commands::columns::run(&path, &sql, &format)?;
        }
        Commands::Backup { output, schema } => {
            let path = cli.path.ok_or("Database path required for backup")?;
            commands::backup::create(&path, &output, &schema)?;
        }
        Commands::Restore { input, schema } => {
            let path = cli.path.ok_or("Database path required for restore")?;
            commands::backup::restore(&input, &path, &schema)?;
        }
        Commands::Version => commands::version::run(),
    }

    Ok(())
}
