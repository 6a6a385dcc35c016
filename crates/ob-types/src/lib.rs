pub mod errors;
pub mod params;
pub mod plugin;
pub mod records;

pub use errors::*;
pub use params::*;
pub use plugin::*;
pub use records::*;
