//! Find-compilers command

use std::path::PathBuf;

use anyhow::Result;
use kiln_core::compiler::{CompilerRegistry, detect};

use crate::ops::Context;
use crate::ui::table;

/// Detect toolchains in `paths` (or `PATH`) and record the new ones.
pub fn find_compilers(paths: &[PathBuf], scope: Option<&str>) -> Result<()> {
    let ctx = Context::load()?;
    let search: Vec<PathBuf> = if paths.is_empty() {
        detect::search_path()
    } else {
        paths.to_vec()
    };
    let registry = CompilerRegistry::with_detector(ctx.paths.scopes.clone(), move || detect::detect(&search));
    let added = registry.find_new(scope)?;

    if added.is_empty() {
        println!("No new compilers found");
        return Ok(());
    }
    let noun = if added.len() == 1 { "compiler" } else { "compilers" };
    println!("Added {} new {noun}:", added.len());
    println!("{}", table::compilers(&added));
    Ok(())
}
