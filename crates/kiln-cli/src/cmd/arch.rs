//! Arch command

use crossterm::style::Stylize;
use kiln_core::concretize::HostArch;
use kiln_core::microarch;

/// Print `platform-os-target` for this machine.
pub fn arch(verbose: bool) {
    let host = HostArch::detect();
    println!("{host}");
    if !verbose {
        return;
    }

    let target = microarch::host();
    let row = |label: &str, value: &str| println!("  {}{value}", format!("{label:<12}").dark_grey());
    println!();
    row("vendor", target.vendor());
    row("family", target.family());
    if target.generation() > 0 {
        row("generation", &target.generation().to_string());
    }
    if !target.ancestors().is_empty() {
        row("ancestors", &target.ancestors().join(", "));
    }
    if !target.features().is_empty() {
        let features: Vec<&str> = target.features().iter().map(String::as_str).collect();
        row("features", &features.join(" "));
    }
}
