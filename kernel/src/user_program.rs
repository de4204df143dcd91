pub mod loader;
pub mod process;
