//! Tables for `find`, `compilers`, `list-repos` and batch summaries.

use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table, presets};
use kiln_core::compiler::CompilerDescriptor;
use kiln_core::installer::{InstallRecord, InstallState, Outcome};
use kiln_core::repo::Repository;
use kiln_schema::ConcreteSpec;

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            header
                .iter()
                .map(|h| Cell::new(h).fg(Color::DarkGrey))
                .collect::<Vec<_>>(),
        );
    table
}

fn state_cell(state: InstallState) -> Cell {
    let color = match state {
        InstallState::Installed => Color::Green,
        InstallState::Failed => Color::Red,
        InstallState::Staged | InstallState::Built => Color::Yellow,
    };
    Cell::new(state).fg(color)
}

/// Install records: hash, spec, state, prefix.
pub fn records(records: &[InstallRecord]) -> Table {
    let mut t = table(&["hash", "spec", "state", "prefix"]);
    for r in records {
        t.add_row(vec![
            Cell::new(r.hash.short()).fg(Color::DarkGrey),
            Cell::new(r.spec.as_ref()).fg(Color::Cyan),
            state_cell(r.state),
            Cell::new(r.prefix.display()),
        ]);
    }
    t
}

/// Compilers in merged-view order.
pub fn compilers(compilers: &[CompilerDescriptor]) -> Table {
    let mut t = table(&["alias", "compiler", "os", "cc", "cxx", "fc"]);
    let path = |p: &Option<std::path::PathBuf>| p.as_ref().map_or_else(|| "-".to_string(), |p| p.display().to_string());
    for c in compilers {
        t.add_row(vec![
            Cell::new(&c.alias).fg(Color::Cyan),
            Cell::new(format!("{}@{}", c.name, c.version)),
            Cell::new(&c.operating_system),
            Cell::new(path(&c.paths.cc)),
            Cell::new(path(&c.paths.cxx)),
            Cell::new(path(&c.paths.fc)),
        ]);
    }
    t
}

/// Repositories in search order.
pub fn repositories(repos: &[Repository]) -> Table {
    let mut t = table(&["namespace", "packages", "root"]);
    for repo in repos {
        t.add_row(vec![
            Cell::new(repo.namespace()).fg(Color::Cyan),
            Cell::new(repo.package_names().len()),
            Cell::new(repo.root().display()),
        ]);
    }
    t
}

/// One row per requested root with its outcome.
pub fn batch<'a>(rows: impl IntoIterator<Item = (&'a ConcreteSpec, Option<&'a Outcome>)>) -> Table {
    let mut t = table(&["spec", "result", "detail"]);
    for (spec, outcome) in rows {
        let (result, detail) = match outcome {
            Some(Outcome::Installed(prefix)) => (Cell::new("installed").fg(Color::Green), prefix.display().to_string()),
            Some(Outcome::AlreadyInstalled(prefix)) => {
                (Cell::new("already installed").fg(Color::Green), prefix.display().to_string())
            }
            Some(Outcome::Fetched) => (Cell::new("fetched").fg(Color::Green), String::new()),
            Some(Outcome::Failed(err)) => (
                Cell::new(err.root_cause().kind())
                    .fg(Color::Red)
                    .add_attribute(Attribute::Bold),
                err.root_cause().to_string(),
            ),
            None => (Cell::new("not run").fg(Color::Yellow), String::new()),
        };
        t.add_row(vec![Cell::new(spec.short_form()).fg(Color::Cyan), result, Cell::new(detail)]);
    }
    t
}
