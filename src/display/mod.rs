//! Terminal and markdown output for the CLI.
//!
//! Provides the markdown result list, progress bars for index builds, and
//! the color theme.

pub mod markdown;
pub mod progress;
pub mod theme;

pub use markdown::{CorpusLabel, NO_RESULTS, render_markdown};
pub use progress::{create_progress_bar, create_spinner, with_spinner};
pub use theme::{THEME, Theme};
