pub mod crowd;
pub mod runs;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
