pub mod analysis;
pub mod classifier;

pub use analysis::spawn_analysis;
