pub mod bars;
pub mod loader;

pub use bars::{Bar, BarStore, DownloadStatus};
pub use loader::{load_instrument, InstrumentView};
