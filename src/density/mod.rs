pub mod book;
pub mod stream;

pub use book::{DensityBook, DensityRecord, Side};
