use anyhow::Context;
use bankfeed::{Config, EngineOptions, EventKind, Pager, Record, Reconciler, RpcLogSource};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let config = Config::from_env().context("configuration")?;

    let source = Arc::new(RpcLogSource::from_config(&config));
    let engine = Reconciler::new(source, EngineOptions::from(&config));
    let mut changes = engine.changes();

    println!("Backfilling history for {} ...", config.contract_address);
    engine.start(&EventKind::all()).await?;

    let mut pager = Pager::new(config.page_size);
    let total = engine.size();
    let revealed = pager.revealed(total);
    println!("{} records on file, showing {}:", total, revealed);
    for record in engine.window(0, revealed) {
        print_record(&record);
    }
    if pager.remaining(total) > 0 {
        println!("... {} more available", pager.remaining(total));
    }

    println!("Watching for new events (Ctrl-C to stop) ...");
    let mut seen = total;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let total = engine.size();
                for record in engine.window(0, total.saturating_sub(seen)) {
                    print_record(&record);
                }
                seen = seen.max(total);
            }
        }
    }

    engine.shutdown();
    Ok(())
}

fn print_record(record: &Record) {
    let sign = match record.kind {
        EventKind::Withdraw => "-",
        _ => "+",
    };
    let when = chrono::DateTime::from_timestamp_millis(record.occurred_at.as_ms())
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| record.occurred_at.to_string());
    println!(
        "[{}] {} {}{} from {} (block {})",
        when,
        record.kind,
        sign,
        record.amount,
        record.actor.short(),
        record.block_number
    );
}
