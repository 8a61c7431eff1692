pub mod hash;
pub mod tree;

pub use tree::AssetTree;
