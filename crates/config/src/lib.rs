pub mod hash;
pub mod loader;
pub mod merge;
pub mod model;

pub use hash::content_hash;
pub use merge::merge_configs;
pub use model::*;
