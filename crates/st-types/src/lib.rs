#[macro_use]
pub mod errors;
pub mod capability;
pub mod job;
pub mod params;
pub mod results;

pub use errors::*;
pub use capability::*;
pub use job::*;
pub use params::*;
pub use results::*;
