// Statement export.

mod export;

pub use export::*;
