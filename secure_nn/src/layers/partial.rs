use crate::{NnErr, Result, TensorShape};

/// A layer input shape that may leave any dimension unset until the layer is linked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartialShape {
    pub batch: Option<usize>,
    pub channels: Option<usize>,
    pub height: Option<usize>,
    pub width: Option<usize>,
    pub features: Option<usize>,
}

impl PartialShape {
    /// A shape with every dimension unset.
    pub fn unset() -> Self {
        Self::default()
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_spatial(mut self, height: usize, width: usize) -> Self {
        self.height = Some(height);
        self.width = Some(width);
        self
    }

    pub fn with_features(mut self, features: usize) -> Self {
        self.features = Some(features);
        self
    }

    fn has_image_dims(&self) -> bool {
        self.channels.is_some() || self.height.is_some() || self.width.is_some()
    }

    /// Resolves the full input shape of a layer.
    ///
    /// Unset dimensions are taken from the predecessor's output, set ones must agree with
    /// it. Without a predecessor every dimension must be set.
    ///
    /// # Arguments
    /// * `prev` - The resolved output shape of the predecessor, if any.
    ///
    /// # Returns
    /// The full shape or an error if it is incomplete or contradicts the predecessor.
    pub fn resolve(&self, prev: Option<TensorShape>) -> Result<TensorShape> {
        let Some(prev) = prev else {
            return self.complete();
        };

        check("batch", self.batch, prev.batch())?;

        match prev {
            TensorShape::Image {
                channels,
                height,
                width,
                ..
            } => {
                if self.features.is_some() {
                    return Err(NnErr::config(format!(
                        "a feature count was given but the predecessor yields the image {prev}"
                    )));
                }

                check("channels", self.channels, channels)?;
                check("height", self.height, height)?;
                check("width", self.width, width)?;
            }
            TensorShape::Flat { features, .. } => {
                if self.has_image_dims() {
                    return Err(NnErr::config(format!(
                        "image dimensions were given but the predecessor yields the flat {prev}"
                    )));
                }

                check("features", self.features, features)?;
            }
        }

        Ok(prev)
    }

    fn complete(&self) -> Result<TensorShape> {
        let batch = require("batch", self.batch)?;

        if self.features.is_some() && !self.has_image_dims() {
            return Ok(TensorShape::flat(batch, require("features", self.features)?));
        }

        Ok(TensorShape::image(
            batch,
            require("channels", self.channels)?,
            require("height", self.height)?,
            require("width", self.width)?,
        ))
    }
}

impl From<TensorShape> for PartialShape {
    fn from(value: TensorShape) -> Self {
        match value {
            TensorShape::Image {
                batch,
                channels,
                height,
                width,
            } => Self::unset()
                .with_batch(batch)
                .with_channels(channels)
                .with_spatial(height, width),
            TensorShape::Flat { batch, features } => {
                Self::unset().with_batch(batch).with_features(features)
            }
        }
    }
}

fn require(what: &str, value: Option<usize>) -> Result<usize> {
    match value {
        Some(0) => Err(NnErr::config(format!("{what} must be positive"))),
        Some(v) => Ok(v),
        None => Err(NnErr::config(format!(
            "no predecessor to take the {what} from and none was given"
        ))),
    }
}

fn check(what: &'static str, given: Option<usize>, resolved: usize) -> Result<()> {
    match given {
        Some(v) if v != resolved => Err(NnErr::mismatch(what, v, resolved)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_dims_come_from_the_predecessor() {
        let prev = TensorShape::image(4, 3, 8, 8);
        assert_eq!(PartialShape::unset().resolve(Some(prev)).unwrap(), prev);
        assert_eq!(
            PartialShape::unset()
                .with_batch(4)
                .resolve(Some(prev))
                .unwrap(),
            prev
        );
    }

    #[test]
    fn explicit_dims_must_agree() {
        let prev = TensorShape::flat(4, 10);
        let err = PartialShape::unset()
            .with_batch(8)
            .resolve(Some(prev))
            .unwrap_err();

        assert!(matches!(
            err,
            NnErr::ShapeMismatch {
                what: "batch",
                got: 8,
                expected: 4,
                ..
            }
        ));
    }

    #[test]
    fn no_predecessor_and_no_shape_is_a_configuration_error() {
        let err = PartialShape::unset().resolve(None).unwrap_err();
        assert!(matches!(err, NnErr::Configuration { .. }));

        let err = PartialShape::unset()
            .with_batch(2)
            .with_channels(1)
            .resolve(None)
            .unwrap_err();
        assert!(matches!(err, NnErr::Configuration { .. }));
    }

    #[test]
    fn full_shapes_resolve_alone() {
        let shape = TensorShape::image(2, 1, 5, 7);
        assert_eq!(PartialShape::from(shape).resolve(None).unwrap(), shape);

        let shape = TensorShape::flat(2, 9);
        assert_eq!(PartialShape::from(shape).resolve(None).unwrap(), shape);
    }
}
