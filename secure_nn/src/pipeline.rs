use std::collections::HashMap;

use log::debug;

use crate::{
    NnErr, Result, TensorShape,
    layers::{Layer, LayerKind, LayerSpec},
};

/// An ordered sequence of linked layers forming one computation path.
///
/// Layers are wired as they are pushed: each one resolves its shape from the layer pushed
/// right before it, so the shapes of a pipeline only depend on the order of its layers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    layers: Vec<Layer>,
    names: HashMap<String, usize>,
}

impl Pipeline {
    /// Creates a new empty `Pipeline`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Links `spec` after the last layer.
    ///
    /// # Arguments
    /// * `spec` - The declaration of the layer.
    ///
    /// # Returns
    /// The wired layer or an error if its name is taken or its shape does not fit.
    pub fn push(&mut self, spec: LayerSpec) -> Result<&Layer> {
        let name = spec.name().to_string();

        if self.names.contains_key(&name) {
            return Err(NnErr::Configuration {
                layer: name,
                detail: "the name is already used in this pipeline".into(),
            });
        }

        match (spec.kind(), self.layers.last()) {
            (LayerKind::Input, Some(_)) => {
                return Err(NnErr::Configuration {
                    layer: name,
                    detail: "the input layer must come first".into(),
                });
            }
            (_, Some(last)) if matches!(last.kind(), LayerKind::Output) => {
                return Err(NnErr::Configuration {
                    layer: name,
                    detail: format!("no layer may follow the output layer {}", last.name()),
                });
            }
            _ => {}
        }

        let index = self.layers.len();
        let layer = spec.init_shape(index, self.layers.last())?;
        debug!(layer = index; "{name}: {} -> {}", layer.input_shape(), layer.output_shape());

        self.names.insert(name, index);
        self.layers.push(layer);
        Ok(&self.layers[index])
    }

    /// Checks the pipeline starts with an input layer and ends with an output layer.
    ///
    /// # Returns
    /// The complete pipeline.
    pub fn finish(self) -> Result<Self> {
        match self.layers.first().map(Layer::kind) {
            Some(LayerKind::Input) => {}
            _ => return Err(NnErr::config("a pipeline must start with an input layer")),
        }

        match self.layers.last().map(Layer::kind) {
            Some(LayerKind::Output) => {}
            _ => return Err(NnErr::config("a pipeline must end with an output layer")),
        }

        Ok(self)
    }

    /// Looks a layer up by name.
    pub fn get(&self, name: &str) -> Option<&Layer> {
        self.names.get(name).map(|&i| &self.layers[i])
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// The layer right before `layer`.
    pub fn predecessor(&self, layer: &Layer) -> Option<&Layer> {
        layer.prev().and_then(|i| self.layers.get(i))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// The shape fed into the first layer.
    pub fn input_shape(&self) -> Option<TensorShape> {
        self.layers.first().map(Layer::input_shape)
    }

    /// The shape revealed by the last layer.
    pub fn output_shape(&self) -> Option<TensorShape> {
        self.layers.last().map(Layer::output_shape)
    }

    /// The fixed batch dimension every batch must match.
    pub fn batch_size(&self) -> Option<usize> {
        self.input_shape().map(|s| s.batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::PartialShape;

    fn small() -> Pipeline {
        let mut pipeline = Pipeline::new();
        pipeline
            .push(LayerSpec::input("input", TensorShape::image(4, 1, 8, 8)))
            .unwrap();
        pipeline.push(LayerSpec::conv2d("conv1", 2, 3)).unwrap();
        pipeline.push(LayerSpec::relu("relu1")).unwrap();
        pipeline.push(LayerSpec::max_pool2d("pool1", 2)).unwrap();
        pipeline.push(LayerSpec::flatten("flatten")).unwrap();
        pipeline.push(LayerSpec::matmul("fc1", 3)).unwrap();
        pipeline.push(LayerSpec::output("output")).unwrap();
        pipeline
    }

    #[test]
    fn shapes_flow_through_the_pipeline() {
        let pipeline = small().finish().unwrap();

        assert_eq!(
            pipeline.get("pool1").unwrap().output_shape(),
            TensorShape::image(4, 2, 4, 4)
        );
        assert_eq!(
            pipeline.get("flatten").unwrap().output_shape(),
            TensorShape::flat(4, 32)
        );
        assert_eq!(pipeline.output_shape(), Some(TensorShape::flat(4, 3)));
        assert_eq!(pipeline.batch_size(), Some(4));

        for pair in pipeline.layers().windows(2) {
            assert_eq!(pair[0].output_shape(), pair[1].input_shape());
            assert_eq!(pipeline.predecessor(&pair[1]), Some(&pair[0]));
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut pipeline = small();
        let err = pipeline.push(LayerSpec::relu("relu1")).unwrap_err();
        assert!(matches!(err, NnErr::Configuration { .. }));
    }

    #[test]
    fn nothing_follows_the_output() {
        let mut pipeline = small();
        assert!(pipeline.push(LayerSpec::relu("relu9")).is_err());
    }

    #[test]
    fn input_only_comes_first() {
        let mut pipeline = Pipeline::new();
        pipeline
            .push(LayerSpec::input("a", TensorShape::flat(1, 1)))
            .unwrap();
        assert!(
            pipeline
                .push(LayerSpec::input("b", TensorShape::flat(1, 1)))
                .is_err()
        );
    }

    #[test]
    fn unfinished_pipelines_are_rejected() {
        let mut pipeline = Pipeline::new();
        pipeline
            .push(LayerSpec::input("input", TensorShape::flat(2, 4)))
            .unwrap();
        pipeline.push(LayerSpec::matmul("fc1", 2)).unwrap();
        assert!(pipeline.finish().is_err());

        let mut pipeline = Pipeline::new();
        let first = LayerSpec::relu("relu").with_shape(PartialShape::from(TensorShape::flat(2, 4)));
        pipeline.push(first).unwrap();
        pipeline.push(LayerSpec::output("output")).unwrap();
        assert!(pipeline.finish().is_err());
    }

    #[test]
    fn failed_push_leaves_the_pipeline_untouched() {
        let mut pipeline = Pipeline::new();
        pipeline
            .push(LayerSpec::input("input", TensorShape::image(1, 1, 3, 3)))
            .unwrap();

        assert!(pipeline.push(LayerSpec::conv2d_with("conv", 1, 5, Some(0), 1)).is_err());
        assert_eq!(pipeline.len(), 1);
        assert!(pipeline.get("conv").is_none());
    }
}
