//! Find command

use std::sync::Arc;

use anyhow::{Context as _, Result};
use kiln_core::NullReporter;
use kiln_schema::AbstractSpec;

use crate::ops::Context;
use crate::ui::table;

/// List install records, optionally filtered by a constraint.
pub async fn find(spec: Option<&str>) -> Result<()> {
    let constraint = spec
        .map(|s| AbstractSpec::parse(s).with_context(|| format!("Invalid spec '{s}'")))
        .transpose()?;
    let ctx = Context::load()?;
    let installer = ctx.installer(Arc::new(NullReporter));
    let records = installer.records(constraint.as_ref()).await?;

    if records.is_empty() {
        println!();
        println!("  No matching specs installed.");
        return Ok(());
    }
    println!("{}", table::records(&records));
    Ok(())
}
