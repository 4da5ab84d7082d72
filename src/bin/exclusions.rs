//! Offline admin tool for editing the `exclusions` table — spec.md §6
//! "Admin tool (peripheral)".
//!
//! Grounded on `original_source/manage_exclusions.py`'s three subcommands,
//! argument shapes, and exit-code contract (0 on success; non-zero with a
//! message on unique-violation or missing id).

use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use clap::{Parser, Subcommand};
use tokio_postgres::NoTls;

use bf1942_ingest::config::Config;

#[derive(Parser)]
#[command(name = "bf1942-exclusions", about = "Manage the BF1942 ingest exclusion list")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all current exclusions, optionally filtered by type.
    List {
        #[arg(long = "type")]
        exclusion_type: Option<String>,
    },
    /// Add a new exclusion.
    Add {
        #[arg(value_parser = ["gametype", "player_name", "server_id"])]
        exclusion_type: String,
        value: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Remove an exclusion by its numeric id.
    Remove { id: i32 },
}

#[tokio::main]
async fn main() {
    pretty_env_logger::init();
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let manager = match PostgresConnectionManager::new_from_stringlike(&config.postgres_dsn, NoTls) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("invalid POSTGRES_DSN: {e}");
            std::process::exit(1);
        }
    };
    let pool = match Pool::builder().build(manager).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("could not connect: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = match cli.command {
        Command::List { exclusion_type } => list(&pool, exclusion_type).await,
        Command::Add { exclusion_type, value, notes } => add(&pool, exclusion_type, value, notes).await,
        Command::Remove { id } => remove(&pool, id).await,
    };
    std::process::exit(exit_code);
}

async fn list(pool: &Pool<PostgresConnectionManager<NoTls>>, exclusion_type: Option<String>) -> i32 {
    let conn = match pool.get().await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("database error: {e}");
            return 1;
        }
    };

    let rows = match &exclusion_type {
        Some(t) => conn
            .query(
                "SELECT id, type, value, notes FROM exclusions WHERE type = $1 ORDER BY type, value;",
                &[t],
            )
            .await,
        None => {
            conn.query("SELECT id, type, value, notes FROM exclusions ORDER BY type, value;", &[])
                .await
        }
    };

    let rows = match rows {
        Ok(rows) => rows,
        Err(e) => {
            eprintln!("database error: {e}");
            return 1;
        }
    };

    println!("--- Current Exclusions ---");
    if rows.is_empty() {
        println!("No exclusions found.");
        return 0;
    }
    for row in rows {
        let id: i32 = row.get("id");
        let t: String = row.get("type");
        let value: String = row.get("value");
        let notes: Option<String> = row.get("notes");
        println!(
            "ID: {:<4} Type: {:<20} Value: {:<25} Notes: {}",
            id,
            t,
            value,
            notes.unwrap_or_default()
        );
    }
    0
}

async fn add(
    pool: &Pool<PostgresConnectionManager<NoTls>>,
    exclusion_type: String,
    value: String,
    notes: Option<String>,
) -> i32 {
    let conn = match pool.get().await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("database error: {e}");
            return 1;
        }
    };

    match conn
        .execute(
            "INSERT INTO exclusions (type, value, notes) VALUES ($1, $2, $3);",
            &[&exclusion_type, &value, &notes],
        )
        .await
    {
        Ok(_) => {
            println!("Successfully added exclusion: [Type: {exclusion_type}, Value: {value}]");
            0
        }
        Err(e) if is_unique_violation(&e) => {
            eprintln!("Error: an exclusion for [Type: {exclusion_type}, Value: {value}] already exists.");
            1
        }
        Err(e) => {
            eprintln!("An unexpected error occurred: {e}");
            1
        }
    }
}

async fn remove(pool: &Pool<PostgresConnectionManager<NoTls>>, id: i32) -> i32 {
    let conn = match pool.get().await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("database error: {e}");
            return 1;
        }
    };

    match conn.execute("DELETE FROM exclusions WHERE id = $1;", &[&id]).await {
        Ok(1) => {
            println!("Successfully removed exclusion with ID: {id}");
            0
        }
        Ok(_) => {
            eprintln!("Error: no exclusion found with ID: {id}");
            1
        }
        Err(e) => {
            eprintln!("database error: {e}");
            1
        }
    }
}

fn is_unique_violation(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION)
}
