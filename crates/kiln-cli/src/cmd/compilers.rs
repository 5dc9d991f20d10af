//! Compilers command

use anyhow::Result;

use crate::ops::Context;
use crate::ui::table;

/// List configured compilers, running detection on first use.
pub fn compilers(scope: Option<&str>) -> Result<()> {
    let ctx = Context::load()?;
    let found = ctx.compilers.all(scope)?;
    if found.is_empty() {
        println!();
        println!("  No compilers configured.");
        println!("  Run 'kiln find-compilers' to search PATH.");
        return Ok(());
    }
    println!("{}", table::compilers(&found));
    Ok(())
}
