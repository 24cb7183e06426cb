use clap::Parser;
use unchained_light::{config, logging, serverpool, storage::Store};

/// Print the persisted Server Pool, best score first.
#[derive(Parser, Debug)]
#[command(name = "inspect_pool")]
struct Args {
    /// Path to the node configuration file.
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Only show the first N entries.
    #[arg(long)]
    limit: Option<usize>,

    /// Log verbosity 0..=5, overriding `[log] level`.
    #[arg(short, long)]
    verbosity: Option<u8>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = config::load(&args.config)?;
    match args.verbosity {
        Some(v) => logging::set_verbosity(v)?,
        None => logging::init(&cfg.log.level)?,
    }
    println!("🔍 Inspecting server pool at {}", cfg.storage.path);

    let store = Store::open(&cfg.storage.path)?;
    let mut entries = serverpool::load_entries(&store)?;
    tracing::debug!(entries = entries.len(), path = %cfg.storage.path, "server pool loaded");
    entries.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    if entries.is_empty() {
        println!("❌ No server pool entries found");
        return Ok(());
    }

    let shown = args.limit.unwrap_or(entries.len()).min(entries.len());
    println!("{:<54} {:>6} {:>9} {:>8}  address", "peer", "score", "failures", "backoff");
    for e in entries.iter().take(shown) {
        let addr = e.addr.as_ref().map(|a| a.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "{:<54} {:>6.3} {:>9} {:>7}s  {}",
            e.id.to_string(),
            e.score,
            e.failures,
            e.backoff.as_secs(),
            addr
        );
    }
    println!("\n📈 {} of {} entries shown", shown, entries.len());
    store.close()?;
    Ok(())
}
