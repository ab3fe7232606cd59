pub mod engine;
pub mod executor;
pub mod memory;
pub mod patterns;
pub mod rule;
pub mod table;

pub use engine::*;
pub use executor::*;
pub use memory::*;
pub use rule::*;
pub use table::*;
