//! `conveyor-dispatch init` and `status`: offline carrier store commands.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use conveyor_dispatch::dispatch::store::CarrierStore;

pub fn cmd_init(db_path: &Path, dwell_time: Duration) -> Result<()> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = CarrierStore::open(db_path)?;
    store.set_dwell_time(dwell_time)?;

    println!("Carrier store initialized at {}", db_path.display());
    println!("  dwell time: {:.1}s", dwell_time.as_secs_f64());
    Ok(())
}

pub fn cmd_status(db_path: &Path) -> Result<()> {
    if !db_path.exists() {
        anyhow::bail!(
            "No carrier store at {}. Run 'conveyor-dispatch init' first.",
            db_path.display()
        );
    }
    let store = CarrierStore::open(db_path)?;
    let queues = store.list_queues()?;
    let carriers = store.list_carriers()?;

    println!();
    println!("{}", console::style("Conveyor Status").bold().cyan());
    println!("{}", console::style("===============").dim());
    println!();
    println!("Store: {}", db_path.display());
    println!("Dwell time: {:.1}s", store.dwell_time()?.as_secs_f64());
    println!();

    if queues.is_empty() {
        println!(
            "{}",
            console::style("No checkpoints registered yet (start the server once).").dim()
        );
    } else {
        println!("{}", console::style("Checkpoints").bold());
        for queue in &queues {
            let residents = if queue.carriers.is_empty() {
                console::style("empty".to_string()).dim().to_string()
            } else {
                queue
                    .carriers
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(" <- ")
            };
            println!("  {:>3}  {}", queue.checkpoint, residents);
        }
    }
    println!();

    if carriers.is_empty() {
        println!("{}", console::style("No carriers on the conveyor.").dim());
    } else {
        println!("{}", console::style("Carriers").bold());
        for carrier in &carriers {
            let location = match carrier.checkpoint {
                Some(checkpoint) => format!("checkpoint {}", checkpoint),
                None => console::style("in transit".to_string()).yellow().to_string(),
            };
            println!(
                "  #{:<5} {:<20} updated {}",
                carrier.id, location, carrier.updated_at
            );
        }
        let in_transit = carriers.iter().filter(|c| c.in_transit).count();
        if in_transit > 0 {
            println!();
            println!(
                "{} {} carrier(s) in transit need operator reconciliation",
                console::style("⚠").yellow(),
                in_transit
            );
        }
    }
    println!();
    Ok(())
}
