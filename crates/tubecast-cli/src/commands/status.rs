//! `tubecast status`: per-schedule progress counters.

use clap::Args;
use console::style;
use tubecast_core::config::Config;
use tubecast_core::storage::{self, schedules};

/// Arguments for `tubecast status`.
#[derive(Args)]
pub struct StatusArgs {
    /// Emit machine-readable JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Print every schedule's status and counters.
pub async fn execute(args: &StatusArgs, config: Config) -> anyhow::Result<()> {
    // A read-mostly one-shot command needs no worker-sized pool.
    let db = storage::init_db(&config.database.path, 2).await?;
    let all = schedules::list_schedules(&db).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&all)?);
        return Ok(());
    }

    if all.is_empty() {
        println!("No schedules.");
        return Ok(());
    }

    println!(
        "{:<5} {:<24} {:<16} {:>7} {:>7} {:>7}  {}",
        style("ID").bold(),
        style("NAME").bold(),
        style("STATUS").bold(),
        style("TOTAL").bold(),
        style("POSTED").bold(),
        style("FAILED").bold(),
        style("NEXT RUN").bold(),
    );
    for schedule in all {
        println!(
            "{:<5} {:<24} {:<16} {:>7} {:>7} {:>7}  {}",
            schedule.id,
            truncate(&schedule.name, 24),
            schedule.status.as_str(),
            schedule.total_comments,
            schedule.posted_comments,
            schedule.failed_comments,
            schedule.next_run_at.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
