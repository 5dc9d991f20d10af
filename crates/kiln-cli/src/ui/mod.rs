//! Terminal output: the console [`Reporter`](kiln_core::Reporter), tables
//! and the shared theme.

pub mod output;
pub mod table;
pub mod theme;

pub use output::Console;
pub use theme::Theme;
