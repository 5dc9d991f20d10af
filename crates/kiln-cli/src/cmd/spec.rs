//! Spec command

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Result;
use crossterm::style::Stylize;
use kiln_schema::{ConcreteSpec, DagHash};

use crate::ops::Context;

/// Print the concretized graph of `spec` with hashes and edge types.
pub async fn spec(spec: &str) -> Result<()> {
    let ctx = Context::load()?;
    let root = ctx.concretize(&[spec.to_string()])?.remove(0);
    let installer = ctx.installer(Arc::new(kiln_core::NullReporter));
    let installed: HashSet<DagHash> = installer
        .records(None)
        .await?
        .into_iter()
        .filter(|r| r.is_live())
        .map(|r| r.hash)
        .collect();
    print!("{}", render(&root, &installed));
    Ok(())
}

/// One line per edge, depth-first. Every node after its first appearance is
/// listed without its subtree.
pub fn render(root: &Arc<ConcreteSpec>, installed: &HashSet<DagHash>) -> String {
    let mut out = String::new();
    let mut seen = HashSet::new();
    line(&mut out, root, None, 0, installed, &mut seen);
    out
}

fn line(
    out: &mut String,
    spec: &Arc<ConcreteSpec>,
    types: Option<String>,
    depth: usize,
    installed: &HashSet<DagHash>,
    seen: &mut HashSet<DagHash>,
) {
    let status = if installed.contains(spec.hash()) {
        "[+]".green().to_string()
    } else {
        " - ".dark_grey().to_string()
    };
    let edge = types.map_or_else(String::new, |t| format!("[{t}] "));
    let caret = if depth > 0 { "^" } else { "" };
    let _ = writeln!(
        out,
        "{status}  {}  {:indent$}{}{caret}{spec}",
        spec.hash().short().dark_grey(),
        "",
        edge.dark_grey(),
        indent = depth * 4
    );
    if !seen.insert(spec.hash().clone()) {
        return;
    }
    for dep in spec.dependencies() {
        line(out, &dep.spec, Some(dep.types.to_string()), depth + 1, installed, seen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_schema::{ConcreteArch, ConcreteCompiler, DepTypes, DependencyEdge, SpecNode, Version};

    fn node(name: &str) -> SpecNode {
        SpecNode {
            name: name.into(),
            namespace: "builtin".into(),
            version: Version::parse("1.0").unwrap(),
            variants: Default::default(),
            compiler: ConcreteCompiler {
                name: "gcc".into(),
                version: Version::parse("12.3.0").unwrap(),
            },
            arch: ConcreteArch {
                platform: "linux".into(),
                os: "ubuntu22.04".into(),
                target: "x86_64".into(),
            },
        }
    }

    #[test]
    fn test_shared_nodes_print_their_subtree_once() {
        let zlib = ConcreteSpec::new(node("zlib"), Vec::new()).unwrap();
        let edge = |spec: &Arc<ConcreteSpec>, types| DependencyEdge {
            spec: Arc::clone(spec),
            types,
        };
        let png = ConcreteSpec::new(node("libpng"), vec![edge(&zlib, DepTypes::default())]).unwrap();
        let app = ConcreteSpec::new(
            node("app"),
            vec![edge(&png, DepTypes::LINK), edge(&zlib, DepTypes::BUILD)],
        )
        .unwrap();

        let installed: HashSet<DagHash> = [zlib.hash().clone()].into_iter().collect();
        let text = render(&app, &installed);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("app@=1.0"));
        assert!(lines.iter().any(|l| l.contains("^libpng@=1.0")));
        assert_eq!(lines.iter().filter(|l| l.contains("^zlib@=1.0")).count(), 2);
        assert_eq!(text.matches("[+]").count(), 2);
        assert!(text.contains(zlib.hash().short()));
    }
}
