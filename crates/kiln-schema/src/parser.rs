//! Spec text parser.
//!
//! ```text
//! [namespace.]name [@versions] [+var|~var|-var|key=value]... [%compiler[@versions]]
//!     [arch=platform-os-target | platform=.. | os=.. | target=..] [^dep ...]...
//! ```
//!
//! Every `^` opens a new dependency constraint; the tokens that follow apply
//! to it until the next `^`. All dependency constraints attach to the root.

use thiserror::Error;

use crate::spec::{AbstractSpec, ArchConstraint, CompilerConstraint};
use crate::variant::VariantValue;
use crate::version::VersionList;

/// Errors produced while parsing spec text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    /// The text is not a well-formed spec.
    #[error("invalid spec '{input}' at position {position}: {message}")]
    InvalidSpecSyntax {
        /// Full input text.
        input: String,
        /// Byte offset of the problem.
        position: usize,
        /// What was expected.
        message: String,
    },
}

impl SpecError {
    pub(crate) fn syntax(input: &str, position: usize, message: impl Into<String>) -> Self {
        Self::InvalidSpecSyntax {
            input: input.to_string(),
            position,
            message: message.into(),
        }
    }

    /// Taxonomy name of the error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSpecSyntax { .. } => "InvalidSpecSyntax",
        }
    }
}

/// Parse spec text into an [`AbstractSpec`].
///
/// # Errors
///
/// Returns [`SpecError::InvalidSpecSyntax`] describing the first problem.
pub fn parse(input: &str) -> Result<AbstractSpec, SpecError> {
    Parser::new(input).parse()
}

struct Parser<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.')
}

fn is_variant_name(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-')
}

fn is_version(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b':' | b',' | b'=' | b'_' | b'-')
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, position: usize, message: impl Into<String>) -> SpecError {
        SpecError::syntax(self.input, position, message)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.pos += 1;
        }
        &self.input[start..self.pos]
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse(mut self) -> Result<AbstractSpec, SpecError> {
        if let Some(idx) = self.input.find(|c: char| !c.is_ascii()) {
            return Err(self.error(idx, "non-ASCII character"));
        }

        let mut root = AbstractSpec::default();
        let mut deps: Vec<AbstractSpec> = Vec::new();

        loop {
            self.skip_whitespace();
            let Some(b) = self.peek() else { break };
            let start = self.pos;

            if b == b'^' {
                self.pos += 1;
                self.skip_whitespace();
                let name_at = self.pos;
                if !self.peek().is_some_and(is_ident_start) {
                    return Err(self.error(name_at, "expected a package name after '^'"));
                }
                let mut dep = AbstractSpec::default();
                let ident = self.take_while(is_ident);
                set_name(&mut dep, ident);
                deps.push(dep);
                continue;
            }

            let current = deps.last_mut().unwrap_or(&mut root);
            match b {
                b'@' => {
                    self.pos += 1;
                    let text = self.take_while(is_version);
                    if text.is_empty() {
                        return Err(self.error(start, "expected a version after '@'"));
                    }
                    if !current.versions.is_any() {
                        return Err(self.error(start, "version specified twice"));
                    }
                    current.versions = VersionList::parse(text)
                        .map_err(|e| SpecError::syntax(self.input, start + 1, e.to_string()))?;
                }
                b'+' | b'~' | b'-' => {
                    self.pos += 1;
                    let name = self.take_while(is_variant_name);
                    if name.is_empty() {
                        return Err(self.error(start, "expected a variant name"));
                    }
                    insert_variant(current, name, VariantValue::Bool(b == b'+'))
                        .map_err(|msg| SpecError::syntax(self.input, start, msg))?;
                }
                b'%' => {
                    self.pos += 1;
                    let name = self.take_while(is_variant_name);
                    if name.is_empty() {
                        return Err(self.error(start, "expected a compiler name after '%'"));
                    }
                    if current.compiler.is_some() {
                        return Err(self.error(start, "compiler specified twice"));
                    }
                    let mut compiler = CompilerConstraint::named(name);
                    if self.peek() == Some(b'@') {
                        let at = self.pos;
                        self.pos += 1;
                        let text = self.take_while(is_version);
                        if text.is_empty() {
                            return Err(self.error(at, "expected a compiler version after '@'"));
                        }
                        compiler.versions = VersionList::parse(text)
                            .map_err(|e| SpecError::syntax(self.input, at + 1, e.to_string()))?;
                    }
                    current.compiler = Some(compiler);
                }
                b if is_ident_start(b) => {
                    let ident = self.take_while(is_ident);
                    if self.peek() == Some(b'=') {
                        self.pos += 1;
                        let value = self.take_while(|b| !b.is_ascii_whitespace());
                        if value.is_empty() {
                            return Err(self.error(start, format!("expected a value for '{ident}'")));
                        }
                        assign(current, ident, value)
                            .map_err(|msg| SpecError::syntax(self.input, start, msg))?;
                    } else if *current == AbstractSpec::default() {
                        set_name(current, ident);
                    } else {
                        return Err(self.error(
                            start,
                            format!("unexpected '{ident}': the package name must come first"),
                        ));
                    }
                }
                other => {
                    return Err(self.error(start, format!("unexpected character '{}'", other as char)));
                }
            }
        }

        root.dependencies = deps;
        Ok(root)
    }
}

fn set_name(spec: &mut AbstractSpec, ident: &str) {
    match ident.rsplit_once('.') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() => {
            spec.namespace = Some(ns.to_string());
            spec.name = Some(name.to_string());
        }
        _ => spec.name = Some(ident.to_string()),
    }
}

fn insert_variant(spec: &mut AbstractSpec, name: &str, value: VariantValue) -> Result<(), String> {
    if spec.variants.contains_key(name) {
        return Err(format!("variant '{name}' specified twice"));
    }
    spec.variants.insert(name.to_string(), value);
    Ok(())
}

fn set_arch_field(slot: &mut Option<String>, key: &str, value: &str) -> Result<(), String> {
    if slot.is_some() {
        return Err(format!("'{key}' specified twice"));
    }
    *slot = Some(value.to_string());
    Ok(())
}

fn assign(spec: &mut AbstractSpec, key: &str, value: &str) -> Result<(), String> {
    let arch: &mut ArchConstraint = &mut spec.arch;
    match key {
        "arch" => {
            let parts: Vec<&str> = value.split('-').collect();
            let [platform, os, target] = parts.as_slice() else {
                return Err(format!("arch '{value}' must be platform-os-target"));
            };
            if platform.is_empty() || os.is_empty() || target.is_empty() {
                return Err(format!("arch '{value}' has an empty component"));
            }
            set_arch_field(&mut arch.platform, "platform", platform)?;
            set_arch_field(&mut arch.os, "os", os)?;
            set_arch_field(&mut arch.target, "target", target)
        }
        "platform" => set_arch_field(&mut arch.platform, key, value),
        "os" => set_arch_field(&mut arch.os, key, value),
        "target" => set_arch_field(&mut arch.target, key, value),
        _ => {
            if key.contains('.') {
                return Err(format!("invalid variant name '{key}'"));
            }
            insert_variant(spec, key, VariantValue::from_assignment(value))
        }
    }
}
