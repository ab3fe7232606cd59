pub mod epoch;
pub mod registry;

pub use epoch::*;
pub use registry::*;
