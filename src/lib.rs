pub mod analyzer;
pub mod blocks;
pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod instrument;
pub mod linkage;
pub mod model;
pub mod patchup;
pub mod paths;
pub mod report;
pub mod session;
pub mod store;

pub use analyzer::{Analysis, Analyzer};
pub use collector::{Collector, HookMask, HostEvent, Strategy};
pub use config::{Config, StructuralPolicy};
pub use error::{CoverageError, Result};
pub use linkage::Frame;
pub use paths::{FsSource, MemorySource, SourceProvider};
pub use session::{Session, StopReport};
pub use store::CoverageStore;
