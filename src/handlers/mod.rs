pub mod recognize;

pub use recognize::*;
