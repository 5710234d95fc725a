use std::path::Path;

use loam::inspect;
use loam::Result;

use crate::cli::Cli;
use crate::output::Printer;

pub fn run(cli: &Cli, dir: &Path) -> Result<()> {
    let report = inspect::status(dir, cli.backend.into())?;
    let out = Printer::new(cli);

    if out.is_json() {
        out.result(report);
        return Ok(());
    }

    out.line(format!("location: {}", report.location.display()));
    match &report.holder {
        Some(holder) if report.locked => {
            out.line(format!("leader:   {} (pid {})", holder.context, holder.pid))
        }
        Some(holder) => out.line(format!("leader:   none (stale record for {})", holder.context)),
        None if report.locked => out.line("leader:   unknown (lock held)"),
        None => out.line("leader:   none"),
    }
    for name in &report.app_stores {
        out.line(format!("app:      {}", name));
    }
    match &report.log {
        Some(stats) => {
            out.line(format!(
                "log:      {} entries ({} pending, {} synced, {} local-only)",
                stats.total, stats.pending, stats.synced, stats.local_only
            ));
            if let Some(cursor) = &stats.cursor {
                out.line(format!("cursor:   {}", cursor));
            }
        }
        None => out.line("log:      none"),
    }
    Ok(())
}
