//! List-repos command

use anyhow::Result;

use crate::ops::Context;
use crate::ui::table;

/// Print repositories in search order.
pub fn list_repos() -> Result<()> {
    let ctx = Context::load()?;
    println!("{}", table::repositories(ctx.registry.repositories()));
    Ok(())
}
