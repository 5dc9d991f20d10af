//! Fetch command

use std::sync::Arc;

use anyhow::Result;
use kiln_core::Reporter;
use kiln_core::installer::{InstallOptions, Mode};

use crate::ops::Context;
use crate::ui::Console;

/// Fetch, verify and expand sources into their stages.
pub async fn fetch(specs: &[String], dependencies: bool, quiet: bool) -> Result<()> {
    let ctx = Context::load()?;
    let roots = ctx.concretize(specs)?;
    let console = Arc::new(Console::new(quiet));
    console.section("Fetching");
    let installer = ctx.installer(console);
    let options = InstallOptions {
        fail_fast: false,
        mode: Mode::Fetch { dependencies },
    };
    let report = installer.install_all(&roots, &options).await;
    super::install::finish(&roots, &report)
}
