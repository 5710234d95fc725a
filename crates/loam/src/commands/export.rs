use std::path::Path;

use loam::inspect::{self, ExportTarget};
use loam::{core::LoamError, Result};
use serde::Serialize;

use crate::cli::{Cli, ExportWhat};
use crate::output::Printer;

#[derive(Serialize)]
struct ExportOutput {
    store: &'static str,
    output_path: String,
    bytes: usize,
}

pub fn run(cli: &Cli, dir: &Path, what: ExportWhat, out: &Path) -> Result<()> {
    let (target, store) = match what {
        ExportWhat::App => (ExportTarget::App, "app"),
        ExportWhat::Log => (ExportTarget::Log, "log"),
    };
    let bytes = inspect::export(dir, cli.backend.into(), target)?;
    std::fs::write(out, &bytes).map_err(LoamError::from)?;

    Printer::new(cli).result(ExportOutput {
        store,
        output_path: out.display().to_string(),
        bytes: bytes.len(),
    });
    Ok(())
}
