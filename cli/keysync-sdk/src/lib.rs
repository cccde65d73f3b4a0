pub mod keysync;
pub mod models;
pub mod providers;
pub mod utils;

pub use keysync::Keysync;
