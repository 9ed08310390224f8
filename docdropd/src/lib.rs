pub mod daemon;
pub mod device_tree;
pub mod files;
pub mod sync;
