#![forbid(unsafe_code)]
//! Operator CLI for the PointLedger audit ledger.

use clap::{Parser, Subcommand};
use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, Color as TableColor, ContentArrangement, Table};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use pointledger::config::{load_config, load_config_from, Config};
use pointledger::ledger::{ActionType, Ledger, MetaValue, Metadata};
use pointledger::persistence::Database;
use pointledger::reconcile::SqliteTransactions;
#[cfg(feature = "api")]
use pointledger::reconcile::{TransactionSource, Unprivileged};

#[derive(Parser)]
#[command(name = "pointledger", version, about = "Tamper-evident rewards points ledger")]
struct Cli {
    /// Config file (defaults to $POINTLEDGER_CONFIG or pointledger.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the genesis block (no-op when a valid one exists)
    Genesis,
    /// Append a points event
    Append {
        #[arg(long)]
        user: String,
        #[arg(long)]
        action: String,
        #[arg(long, allow_negative_numbers = true)]
        points: i64,
        /// Metadata entry as key=value; repeatable
        #[arg(long = "meta")]
        meta: Vec<String>,
    },
    /// Verify every block in the chain
    Verify,
    /// Compare ledger totals with an operational transactions database
    Reconcile {
        #[arg(long)]
        transactions_db: PathBuf,
    },
    /// Publish, list or check anchors
    Anchor {
        #[command(subcommand)]
        action: AnchorCommand,
    },
    /// Re-seal prevHash and hash fields across the chain
    Repair {
        /// Required: repair rewrites stored blocks
        #[arg(long)]
        yes: bool,
    },
    /// Generate an audit proof document
    Proof {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run the REST API
    #[cfg(feature = "api")]
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        transactions_db: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum AnchorCommand {
    Publish,
    List {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Verify against an anchor; defaults to the latest one
    Verify {
        #[arg(long, requires = "block_count")]
        hash: Option<String>,
        #[arg(long, requires = "hash")]
        block_count: Option<u64>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let ledger = open_ledger(&config)?;

    match cli.command {
        Command::Genesis => {
            let genesis = ledger.create_genesis()?;
            println!("{} {}", "✅ Genesis block:".green().bold(), genesis.hash);
        }
        Command::Append {
            user,
            action,
            points,
            meta,
        } => {
            let metadata = parse_metadata(&meta)?;
            let block = ledger.append(&user, ActionType::from(action), points, metadata)?;
            println!(
                "{} #{} {}",
                "✅ Appended block".green().bold(),
                block.index,
                block.hash.bright_black()
            );
        }
        Command::Verify => {
            let report = ledger.verify_chain()?;
            if report.valid {
                println!("{} {}", "✅".green(), report.message.green());
            } else {
                println!("{} {}", "❌".red(), report.message.red().bold());
                let mut table = new_table(&["Index", "Issue"]);
                for diagnosis in &report.details {
                    for issue in &diagnosis.issues {
                        table.add_row(vec![
                            Cell::new(diagnosis.index).fg(TableColor::Red),
                            Cell::new(issue.to_string()),
                        ]);
                    }
                }
                println!("{}", table);
                std::process::exit(1);
            }
        }
        Command::Reconcile { transactions_db } => {
            let source = open_transactions(&transactions_db)?;
            let report = ledger.reconcile_point_totals(&source)?;
            let mut table = new_table(&["Ledger total", "Transactions total", "Status"]);
            table.add_row(vec![
                Cell::new(report.ledger_total),
                Cell::new(report.transactions_total),
                if report.valid {
                    Cell::new("MATCH").fg(TableColor::Green)
                } else {
                    Cell::new("MISMATCH").fg(TableColor::Red)
                },
            ]);
            println!("{}", table);
            report.into_result()?;
        }
        Command::Anchor { action } => run_anchor(&ledger, action)?,
        Command::Repair { yes } => {
            if !yes {
                eprintln!(
                    "{}",
                    "⚠️  Repair rewrites stored blocks and cannot be undone. Re-run with --yes."
                        .yellow()
                );
                std::process::exit(2);
            }
            let report = ledger.repair_chain()?;
            if !report.changes.is_empty() {
                let mut table = new_table(&["Index", "Field", "Old", "New"]);
                for change in &report.changes {
                    table.add_row(vec![
                        Cell::new(change.index),
                        Cell::new(format!("{:?}", change.field)),
                        Cell::new(short(&change.old_value)),
                        Cell::new(short(&change.new_value)),
                    ]);
                }
                println!("{}", table);
            }
            println!(
                "{} {} blocks repaired, tip {}",
                "🔧".yellow(),
                report.repaired_count,
                report.latest_hash
            );
        }
        Command::Proof { out } => {
            let proof = ledger.generate_audit_proof()?;
            let json = proof.to_json_pretty()?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("{} {}", "📄 Audit proof written to".green(), path.display());
                }
                None => println!("{}", json),
            }
        }
        #[cfg(feature = "api")]
        Command::Serve {
            port,
            transactions_db,
        } => {
            let transactions: Arc<dyn TransactionSource> = match transactions_db {
                Some(path) => Arc::new(open_transactions(&path)?),
                None => Arc::new(Unprivileged),
            };
            let node = Arc::new(pointledger::api::ApiNode::new(
                Arc::new(ledger),
                transactions,
                config.api.admin_token.clone(),
            ));
            let port = port.unwrap_or(config.api.port);
            println!("{} http://0.0.0.0:{}/api", "🚀 Serving".green().bold(), port);
            tokio::runtime::Runtime::new()?
                .block_on(pointledger::api::run_api_server(node, port))?;
        }
    }

    Ok(())
}

fn run_anchor(ledger: &Ledger, action: AnchorCommand) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        AnchorCommand::Publish => {
            let anchor = ledger.publish_anchor()?;
            println!("{} {}", "⚓ Anchor published:".green().bold(), anchor.id);
            println!("   latest hash:  {}", anchor.latest_hash);
            println!("   block count:  {}", anchor.block_count);
            println!(
                "   merkle root:  {}",
                anchor.merkle_root.as_deref().unwrap_or("(none)")
            );
        }
        AnchorCommand::List { limit } => {
            let anchors = ledger.list_anchors(limit)?;
            if anchors.is_empty() {
                println!("{}", "No anchors published yet".yellow());
                return Ok(());
            }
            let mut table = new_table(&["Id", "Published", "Blocks", "Latest hash", "Merkle root"]);
            for anchor in &anchors {
                table.add_row(vec![
                    Cell::new(&anchor.id),
                    Cell::new(&anchor.published_at),
                    Cell::new(anchor.block_count),
                    Cell::new(short(&anchor.latest_hash)),
                    Cell::new(anchor.merkle_root.as_deref().map(short).unwrap_or_default()),
                ]);
            }
            println!("{}", table);
        }
        AnchorCommand::Verify { hash, block_count } => {
            let check = match (hash, block_count) {
                (Some(hash), Some(count)) => Some(ledger.verify_against_anchor(&hash, count)?),
                _ => ledger.verify_latest_anchor()?,
            };
            match check {
                Some(check) if check.valid => println!("{} {}", "✅".green(), check.message),
                Some(check) => {
                    println!("{} {}", "❌".red(), check.message.red().bold());
                    std::process::exit(1);
                }
                None => println!("{}", "No anchor to verify against".yellow()),
            }
        }
    }
    Ok(())
}

fn open_ledger(config: &Config) -> Result<Ledger, Box<dyn std::error::Error>> {
    if let Some(parent) = Path::new(&config.database.path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let db = Database::open(&config.database.path)?;
    Ok(Ledger::with_config(Arc::new(db), config.ledger.clone()))
}

fn open_transactions(path: &Path) -> Result<SqliteTransactions, Box<dyn std::error::Error>> {
    let path = path.to_str().ok_or("transactions db path is not valid UTF-8")?;
    Ok(SqliteTransactions::open(path)?)
}

fn parse_metadata(entries: &[String]) -> Result<Metadata, Box<dyn std::error::Error>> {
    let mut metadata = Metadata::new();
    for entry in entries {
        let (key, raw) = entry
            .split_once('=')
            .ok_or_else(|| format!("metadata entry '{}' is not key=value", entry))?;
        let value = if let Ok(n) = raw.parse::<i64>() {
            MetaValue::Int(n)
        } else if let Ok(b) = raw.parse::<bool>() {
            MetaValue::Bool(b)
        } else {
            MetaValue::from(raw)
        };
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            headers
                .iter()
                .map(|h| Cell::new(h).add_attribute(Attribute::Bold).fg(TableColor::Cyan)),
        );
    table
}

/// First 16 characters; repaired values can be arbitrary tampered text.
fn short(hash: &str) -> String {
    match hash.char_indices().nth(16) {
        Some((cut, _)) => format!("{}…", &hash[..cut]),
        None => hash.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_truncates_hex_hashes() {
        let hash = "a8e554ab0c1d2e3f4a5b6c7d8e9f0011";
        assert_eq!(short(hash), "a8e554ab0c1d2e3f…");
        assert_eq!(short("0"), "0");
        assert_eq!(short("0123456789abcdef"), "0123456789abcdef");
    }

    #[test]
    fn test_short_respects_char_boundaries() {
        assert_eq!(short("abcdefghijklmnoé-tampered"), "abcdefghijklmnoé…");
        assert_eq!(short("ééééééééééééééééé"), "éééééééééééééééé…");
    }

    #[test]
    fn test_parse_metadata_types_values() {
        let meta = parse_metadata(&["n=5".to_string(), "ok=true".to_string(), "s=x=y".to_string()])
            .unwrap();
        assert_eq!(meta.get("n"), Some(&MetaValue::Int(5)));
        assert_eq!(meta.get("ok"), Some(&MetaValue::Bool(true)));
        assert_eq!(meta.get("s"), Some(&MetaValue::from("x=y")));
        assert!(parse_metadata(&["novalue".to_string()]).is_err());
    }
}
