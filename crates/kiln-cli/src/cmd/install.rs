//! Install command

use std::sync::Arc;

use anyhow::Result;
use kiln_core::Reporter;
use kiln_core::installer::{BatchReport, InstallOptions, Mode};
use kiln_schema::ConcreteSpec;

use crate::ops::{BatchFailed, Context};
use crate::ui::{Console, table};

/// Flags that adjust one install batch.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub jobs: Option<usize>,
    pub fail_fast: bool,
    pub keep_stage: bool,
}

/// Concretize and install every spec in one batch.
pub async fn install(specs: &[String], options: &Options, quiet: bool) -> Result<()> {
    let mut ctx = Context::load()?;
    if let Some(jobs) = options.jobs {
        ctx.settings.jobs = jobs.max(1);
    }
    ctx.settings.keep_stage |= options.keep_stage;

    let roots = ctx.concretize(specs)?;
    let console = Arc::new(Console::new(quiet));
    console.section("Installing");
    let installer = ctx.installer(console);
    let batch = InstallOptions {
        fail_fast: options.fail_fast,
        mode: Mode::Install,
    };
    let report = installer.install_all(&roots, &batch).await;
    finish(&roots, &report)
}

/// Print the per-root summary and fail if any node failed.
pub(crate) fn finish(roots: &[Arc<ConcreteSpec>], report: &BatchReport) -> Result<()> {
    let rows = roots.iter().map(|r| (r.as_ref(), report.outcome(r.hash())));
    println!("{}", table::batch(rows));

    let failed = report.failures().count();
    if failed > 0 {
        return Err(BatchFailed {
            failed,
            total: report.nodes.len(),
        }
        .into());
    }
    Ok(())
}
