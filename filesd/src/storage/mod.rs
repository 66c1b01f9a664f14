mod locator;
mod param;

pub use locator::{Location, LocatorError, StorageLocator};
pub use param::{Action, FileParam, FileType, PasteParam};
