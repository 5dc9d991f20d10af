//! Uninstall command

use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use kiln_core::Reporter;
use kiln_core::installer::InstallError;
use kiln_schema::{AbstractSpec, DepTypes, Order};

use crate::ops::Context;
use crate::ui::Console;

/// Remove installed records matching `spec`.
pub async fn uninstall(spec: &str, all: bool, force: bool, quiet: bool) -> Result<()> {
    let constraint = AbstractSpec::parse(spec).with_context(|| format!("Invalid spec '{spec}'"))?;
    let ctx = Context::load()?;
    let console = Arc::new(Console::new(quiet));
    let installer = ctx.installer(Arc::clone(&console) as Arc<dyn Reporter>);

    let mut matches: Vec<_> = installer
        .records(Some(&constraint))
        .await?
        .into_iter()
        .filter(|r| r.is_live())
        .collect();
    if matches.is_empty() {
        return Err(InstallError::NotInstalled(spec.to_string()).into());
    }
    if matches.len() > 1 && !all {
        let names: Vec<String> = matches.iter().map(|r| r.spec.short_form()).collect();
        bail!(
            "'{spec}' matches {} installed specs: {}; use --all to remove every match",
            matches.len(),
            names.join(", ")
        );
    }

    // A dependent's graph strictly contains its dependencies', so larger
    // graphs go first.
    matches.sort_by_cached_key(|r| std::cmp::Reverse(r.spec.traverse(Order::Pre, DepTypes::ALL).count()));

    console.section("Uninstalling");
    for record in &matches {
        let prefix = installer
            .uninstall(&record.spec, force)
            .await
            .with_context(|| format!("Failed to uninstall '{}'", record.spec.short_form()))?;
        if !quiet {
            println!("{} {}", record.spec.short_form(), prefix.display());
        }
    }
    Ok(())
}
