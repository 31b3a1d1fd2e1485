pub mod node;
pub mod resolver;

pub use node::StreamNode;
pub use resolver::{resolve, StreamForest};
