pub mod icons;
pub mod scan_progress;

pub use scan_progress::{ScanUI, UiMode, format_duration, print_snapshot};
