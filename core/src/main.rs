use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notchd::store::ArboardPasteboard;
use notchd::{ClipboardEntry, ClipboardStore, Config, Daemon, HASH_PREFIX_LEN, daemon};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::signal;

#[derive(Parser)]
#[command(name = "notchd")]
#[command(version = "0.3.1")]
#[command(about = "notch overlay engine: clipboard history and system peeks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine daemon
    Daemon,
    /// Print clipboard history
    History,
    /// Print history entries matching a query
    Search {
        /// Case-insensitive substring to match
        query: String,
    },
    /// Copy a selection back to the pasteboard (reads from stdin if no args)
    Copy {
        /// Selection text or #hashprefix reference to copy
        #[arg(trailing_var_arg = true)]
        selection: Vec<String>,
    },
    /// Clear clipboard history
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;

    match cli.command {
        Commands::Daemon => {
            let pasteboard = ArboardPasteboard::new()?;
            let mut daemon = Daemon::new(config, Box::new(pasteboard))?.with_default_adapters();

            tokio::select! {
                result = daemon.run() => {
                    if let Err(e) = result {
                        eprintln!("Daemon error: {e:#}");
                        std::process::exit(1);
                    }
                }
                _ = signal::ctrl_c() => {
                    println!("\nShutting down...");
                }
            }
        }
        Commands::History => {
            let store = ClipboardStore::open(&config)?;
            for entry in store.entries() {
                println!("{}", render_entry(entry));
            }
        }
        Commands::Search { query } => {
            let store = ClipboardStore::open(&config)?;
            let needle = query.to_lowercase();
            for entry in store.entries() {
                let haystack = entry.decoded_text().unwrap_or_default().to_lowercase();
                if haystack.contains(&needle) {
                    println!("{}", render_entry(entry));
                }
            }
        }
        Commands::Copy { selection } => {
            let selection = if selection.is_empty() {
                use std::io::Read;
                let mut buffer = String::new();
                std::io::stdin().read_to_string(&mut buffer)?;
                buffer.trim().to_string()
            } else {
                selection.join(" ")
            };

            if selection.is_empty() {
                return Ok(());
            }

            daemon::send_copy_command(&selection).await?;
        }
        Commands::Clear => {
            // go through the daemon when one is running so its in-memory
            // state stays consistent; fall back to the snapshot otherwise
            if daemon::send_command("CLEAR").await.is_err() {
                let mut store = ClipboardStore::open(&config)?;
                store.clear();
            }
            println!("Clipboard history cleared");
        }
    }

    Ok(())
}

fn render_entry(entry: &ClipboardEntry) -> String {
    let time_str = format_time_ago(entry.captured_at());
    let prefix = entry.hash_prefix();

    match entry.decoded_text() {
        Some(text) => {
            let available = 80usize.saturating_sub(time_str.len() + HASH_PREFIX_LEN + 3);
            let display = truncate_to_fit(&text, available);
            format!("{time_str} {display} #{prefix}")
        }
        None => {
            let kind = entry.kind().tag().trim_start_matches("image-").to_string();
            let size_str = format_size(entry.size_bytes() as u64);
            format!("{time_str} [IMG:{kind} {size_str}] #{prefix}")
        }
    }
}

fn format_time_ago(timestamp: u64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let ago_secs = now.saturating_sub(timestamp);

    if ago_secs < 60 {
        format!("{}s", ago_secs)
    } else if ago_secs < 3600 {
        format!("{}m", ago_secs / 60)
    } else if ago_secs < 86400 {
        format!("{}h", ago_secs / 3600)
    } else {
        format!("{}d", ago_secs / 86400)
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{}K", bytes / 1024)
    } else {
        format!("{}M", bytes / (1024 * 1024))
    }
}

fn truncate_to_fit(text: &str, max_chars: usize) -> String {
    let text = text.replace('\n', " ").replace('\t', " ");

    if text.len() <= max_chars {
        text
    } else {
        let mut end = max_chars.saturating_sub(1);
        while !text.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}
