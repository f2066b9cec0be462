//! `StatusDisplay` trait for the small on-device text display.

/// A row-addressed text display.
pub trait StatusDisplay: Send + Sync {
    /// Number of text rows.
    fn rows(&self) -> usize;

    /// Show `text` on row `index`, or clear the row with `None`.
    /// Out-of-range rows are ignored.
    fn set_row(&self, index: usize, text: Option<&str>);
}
