pub mod poll;
pub mod rows;
pub mod store;

pub use poll::*;
pub use rows::*;
pub use store::*;
