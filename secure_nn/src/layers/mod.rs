mod layer;
mod partial;

pub use layer::{Layer, LayerKind, LayerSpec, Visibility};
pub use partial::PartialShape;
