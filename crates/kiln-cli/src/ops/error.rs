//! Error reporting at the process boundary.
//!
//! Commands return `anyhow::Error`; the typed component errors travel inside
//! it and are recovered here by downcasting each link of the chain.

use std::process::ExitCode;

use crossterm::style::Stylize;
use kiln_core::compiler::CompilerError;
use kiln_core::concretize::ConcretizeError;
use kiln_core::config::ConfigError;
use kiln_core::fetch::FetchError;
use kiln_core::installer::{BuildError, InstallError};
use kiln_core::microarch::MicroarchError;
use kiln_core::repo::RepoError;
use kiln_schema::SpecError;
use thiserror::Error;

/// A batch finished with failed nodes; details were already printed.
#[derive(Error, Debug)]
#[error("{failed} of {total} specs failed")]
pub struct BatchFailed {
    pub failed: usize,
    pub total: usize,
}

/// The taxonomy name of one error, if it is a component error.
fn kind_of(err: &(dyn std::error::Error + 'static)) -> Option<&'static str> {
    // A rolled-back node's cause is boxed.
    let install = err
        .downcast_ref::<InstallError>()
        .or_else(|| err.downcast_ref::<Box<InstallError>>().map(|boxed| &**boxed));
    if let Some(e) = install {
        // A phase failure's source is visited next and names the kind.
        return match e {
            InstallError::Phase { .. } => None,
            other => Some(other.kind()),
        };
    }
    if let Some(e) = err.downcast_ref::<SpecError>() {
        return Some(e.kind());
    }
    if let Some(e) = err.downcast_ref::<ConcretizeError>() {
        return Some(e.kind());
    }
    if let Some(e) = err.downcast_ref::<RepoError>() {
        return Some(e.kind());
    }
    if let Some(e) = err.downcast_ref::<CompilerError>() {
        return Some(e.kind());
    }
    if let Some(e) = err.downcast_ref::<FetchError>() {
        return Some(e.kind());
    }
    if let Some(e) = err.downcast_ref::<BuildError>() {
        return Some(e.kind());
    }
    if let Some(e) = err.downcast_ref::<MicroarchError>() {
        return Some(e.kind());
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return Some("Config");
    }
    if err.downcast_ref::<BatchFailed>().is_some() {
        return Some("BatchFailed");
    }
    None
}

/// Taxonomy names along the chain, outermost first, without repeats.
pub fn kinds(err: &anyhow::Error) -> Vec<&'static str> {
    let mut kinds: Vec<&'static str> = Vec::new();
    for cause in err.chain() {
        if let Some(kind) = kind_of(cause) {
            if kinds.last() != Some(&kind) {
                kinds.push(kind);
            }
        }
    }
    kinds
}

/// Print `err` with its kinds and cause chain to stderr.
pub fn report(err: &anyhow::Error) -> ExitCode {
    let kinds = kinds(err);
    let label = if kinds.is_empty() {
        String::new()
    } else {
        format!("[{}] ", kinds.join(" > "))
    };
    eprintln!("{} {}{err}", "error:".red().bold(), label.yellow());
    for cause in err.chain().skip(1) {
        eprintln!("  {} {cause}", "caused by:".dark_grey());
    }
    ExitCode::FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[test]
    fn test_kinds_follow_the_chain() {
        let cause = InstallError::DependentsExist {
            spec: "zlib@1.3.1/abcdefg".into(),
            names: vec!["libpng@1.6.40/hijklmn".into()],
        };
        let err = Err::<(), _>(cause).context("Failed to uninstall 'zlib'").unwrap_err();
        assert_eq!(kinds(&err), ["DependentsExist"]);
    }

    #[test]
    fn test_wrapped_failures_name_the_root_kind() {
        let err = anyhow::Error::new(InstallError::InstallFailed {
            spec: "zlib@1.3.1/abcdefg".into(),
            cause: Box::new(InstallError::NotInstalled("zlib".into())),
        });
        assert_eq!(kinds(&err), ["InstallFailed", "NotInstalled"]);
    }

    #[test]
    fn test_syntax_errors_are_named() {
        let err = kiln_schema::AbstractSpec::parse("zlib $")
            .context("Invalid spec 'zlib $'")
            .unwrap_err();
        assert_eq!(kinds(&err), ["InvalidSpecSyntax"]);
        assert_eq!(kinds(&anyhow::anyhow!("plain")), Vec::<&str>::new());
    }
}
