mod client;
mod engine;
mod error;
mod filter;
mod normalize;
mod output;
mod resample;
mod response;
mod utils;
mod wide_table;
mod window;

pub use client::*;
pub use engine::*;
pub use error::*;
pub use filter::*;
pub use normalize::*;
pub use output::*;
pub use resample::*;
pub use response::*;
pub use utils::*;
pub use wide_table::*;
pub use window::*;
