use std::path::Path;

use comfy_table::{presets::UTF8_FULL, Table};
use loam::core::SyncStatus;
use loam::{inspect, Result};

use crate::cli::Cli;
use crate::output::Printer;

pub fn run(cli: &Cli, dir: &Path, status: Option<&str>) -> Result<()> {
    let status = status.map(str::parse::<SyncStatus>).transpose()?;
    let entries = inspect::read_log(dir, cli.backend.into(), status)?;
    let out = Printer::new(cli);

    if out.is_json() {
        out.result(entries);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["id", "mutation", "status", "created", "args"]);
    for entry in &entries {
        table.add_row(vec![
            entry.event.id.to_string(),
            entry.event.mutation.clone(),
            entry.sync_status.to_string(),
            entry.created_at.clone(),
            entry.event.args.to_string(),
        ]);
    }
    out.line(table.to_string());
    out.line(format!("{} entries", entries.len()));
    Ok(())
}
