pub mod builder;
pub mod validate;

pub use builder::*;
