use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Block, Recipe};
use crate::{NnErr, Pipeline, Result, TensorShape};

/// The named network topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topology {
    #[serde(rename = "vgg9")]
    Vgg9,
    #[serde(rename = "vgg16")]
    Vgg16,
    #[serde(rename = "alexnet")]
    AlexNet,
    #[serde(rename = "secureml")]
    SecureMl,
    #[serde(rename = "sarda")]
    Sarda,
    #[serde(rename = "minionn")]
    MiniOnn,
    #[serde(rename = "lenet")]
    LeNet,
}

/// The hyperparameters a topology is expanded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hyper {
    pub batch_size: usize,
    pub channels: usize,
    pub image_size: usize,
    pub classes: usize,
    /// Convolution channels, one entry per stage.
    pub widths: Vec<usize>,
    /// Hidden fully connected units, the class count is appended.
    pub units: Vec<usize>,
}

impl Hyper {
    fn cifar(widths: &[usize], units: &[usize]) -> Self {
        Self {
            batch_size: 128,
            channels: 3,
            image_size: 32,
            classes: 10,
            widths: widths.to_vec(),
            units: units.to_vec(),
        }
    }

    fn grayscale(widths: &[usize], units: &[usize]) -> Self {
        Self {
            channels: 1,
            ..Self::cifar(widths, units)
        }
    }

    fn input(&self) -> TensorShape {
        TensorShape::image(self.batch_size, self.channels, self.image_size, self.image_size)
    }

    fn expect(&self, topology: Topology, widths: usize, units: usize) -> Result<()> {
        if self.widths.len() != widths || self.units.len() != units {
            return Err(NnErr::config(format!(
                "{topology} takes {widths} stage widths and {units} hidden unit counts, got {} and {}",
                self.widths.len(),
                self.units.len()
            )));
        }

        Ok(())
    }

    fn dense_head(&self, trailing_relu: bool) -> Vec<Block> {
        let mut blocks = vec![Block::Flatten];
        for &units in &self.units {
            blocks.extend([Block::dense(units), Block::Relu]);
        }

        blocks.push(Block::dense(self.classes));
        if trailing_relu {
            blocks.push(Block::Relu);
        }

        blocks
    }
}

/// Partial overrides of a topology's default hyperparameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HyperOverrides {
    pub batch_size: Option<usize>,
    pub channels: Option<usize>,
    pub image_size: Option<usize>,
    pub classes: Option<usize>,
    pub widths: Option<Vec<usize>>,
    pub units: Option<Vec<usize>>,
}

impl HyperOverrides {
    pub fn apply(&self, hyper: Hyper) -> Hyper {
        Hyper {
            batch_size: self.batch_size.unwrap_or(hyper.batch_size),
            channels: self.channels.unwrap_or(hyper.channels),
            image_size: self.image_size.unwrap_or(hyper.image_size),
            classes: self.classes.unwrap_or(hyper.classes),
            widths: self.widths.clone().unwrap_or(hyper.widths),
            units: self.units.clone().unwrap_or(hyper.units),
        }
    }
}

impl Topology {
    pub const ALL: [Topology; 7] = [
        Topology::Vgg9,
        Topology::Vgg16,
        Topology::AlexNet,
        Topology::SecureMl,
        Topology::Sarda,
        Topology::MiniOnn,
        Topology::LeNet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::Vgg9 => "vgg9",
            Topology::Vgg16 => "vgg16",
            Topology::AlexNet => "alexnet",
            Topology::SecureMl => "secureml",
            Topology::Sarda => "sarda",
            Topology::MiniOnn => "minionn",
            Topology::LeNet => "lenet",
        }
    }

    /// The default hyperparameters of this topology.
    pub fn hyper(&self) -> Hyper {
        match self {
            Topology::Vgg9 => Hyper::cifar(&[64, 128, 256, 512, 512], &[512, 512]),
            Topology::Vgg16 => Hyper::cifar(&[64, 128, 256, 512, 512], &[4096, 4096]),
            Topology::AlexNet => Hyper::cifar(&[128, 256, 384, 384, 256], &[256, 256]),
            Topology::SecureMl => Hyper::cifar(&[], &[128, 128]),
            Topology::Sarda => Hyper::grayscale(&[5], &[100]),
            Topology::MiniOnn => Hyper::grayscale(&[16, 16], &[100]),
            Topology::LeNet => Hyper::grayscale(&[20, 50], &[500]),
        }
    }

    /// Expands this topology into a recipe.
    ///
    /// # Arguments
    /// * `hyper` - The hyperparameters, see `Topology::hyper` for the defaults.
    ///
    /// # Returns
    /// The recipe or an error if the stage counts do not fit the topology.
    pub fn recipe(&self, hyper: &Hyper) -> Result<Recipe> {
        let recipe = Recipe::new(hyper.input());

        let recipe = match self {
            Topology::Vgg9 => {
                hyper.expect(*self, 5, 2)?;

                let mut blocks = Vec::new();
                for (stage, &width) in hyper.widths.iter().enumerate() {
                    // The first two stages hold a single convolution.
                    if stage >= 2 {
                        blocks.extend([Block::conv(width, 3), Block::BatchNorm, Block::Relu]);
                    }
                    blocks.extend([
                        Block::conv(width, 3),
                        Block::BatchNorm,
                        Block::Relu,
                        Block::pool(2),
                    ]);
                }

                recipe.extend(blocks).extend(hyper.dense_head(false))
            }
            Topology::Vgg16 => {
                hyper.expect(*self, 5, 2)?;

                let mut blocks = Vec::new();
                for (&width, extra) in hyper.widths.iter().zip([1, 1, 2, 2, 2]) {
                    for _ in 0..extra {
                        blocks.extend([Block::conv(width, 3), Block::Relu]);
                    }
                    blocks.extend([Block::conv(width, 3), Block::Relu, Block::pool(2)]);
                }

                recipe.extend(blocks).extend(hyper.dense_head(false))
            }
            Topology::AlexNet => {
                hyper.expect(*self, 5, 2)?;

                let w = &hyper.widths;
                let pool = Block::MaxPool {
                    kernel: 3,
                    padding: 1,
                    stride: Some((2, 2)),
                };

                recipe
                    .extend([
                        Block::Conv {
                            filters: w[0],
                            filter_hw: 11,
                            padding: Some(10),
                            stride: 4,
                        },
                        Block::BatchNorm,
                        Block::Relu,
                        pool.clone(),
                        Block::conv(w[1], 5),
                        Block::BatchNorm,
                        Block::Relu,
                        pool,
                        Block::conv(w[2], 3),
                        Block::Relu,
                        Block::conv(w[3], 3),
                        Block::Relu,
                        Block::conv(w[4], 3),
                        Block::Relu,
                    ])
                    .extend(hyper.dense_head(true))
            }
            Topology::SecureMl => {
                hyper.expect(*self, 0, 2)?;
                recipe.extend(hyper.dense_head(true))
            }
            Topology::Sarda => {
                hyper.expect(*self, 1, 1)?;

                recipe
                    .extend([
                        Block::Conv {
                            filters: hyper.widths[0],
                            filter_hw: 2,
                            padding: Some(2),
                            stride: 1,
                        },
                        Block::Relu,
                    ])
                    .extend(hyper.dense_head(true))
            }
            Topology::MiniOnn | Topology::LeNet => {
                hyper.expect(*self, 2, 1)?;

                let mut blocks = Vec::new();
                for &width in &hyper.widths {
                    blocks.extend([
                        Block::Conv {
                            filters: width,
                            filter_hw: 5,
                            padding: Some(4),
                            stride: 1,
                        },
                        Block::Relu,
                        Block::MaxPool {
                            kernel: 2,
                            padding: 0,
                            stride: Some((2, 2)),
                        },
                    ]);
                }

                recipe.extend(blocks).extend(hyper.dense_head(true))
            }
        };

        Ok(recipe)
    }

    /// Builds this topology with its default hyperparameters.
    pub fn build(&self) -> Result<Pipeline> {
        self.recipe(&self.hyper())?.build()
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a configuration names its network: a topology with optional overrides or a full
/// recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchSpec {
    Topology {
        name: Topology,
        #[serde(default)]
        overrides: HyperOverrides,
    },
    Recipe(Recipe),
}

impl ArchSpec {
    /// Expands this architecture into a recipe.
    pub fn recipe(&self) -> Result<Recipe> {
        match self {
            ArchSpec::Topology { name, overrides } => name.recipe(&overrides.apply(name.hyper())),
            ArchSpec::Recipe(recipe) => Ok(recipe.clone()),
        }
    }

    /// Builds the wired pipeline of this architecture.
    pub fn build(&self) -> Result<Pipeline> {
        self.recipe()?.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::LayerKind;

    #[test]
    fn every_topology_builds_with_its_defaults() {
        for topology in Topology::ALL {
            let pipeline = topology.build().unwrap();
            assert_eq!(pipeline.batch_size(), Some(128), "{topology}");
            assert_eq!(pipeline.output_shape(), Some(TensorShape::flat(128, 10)), "{topology}");
        }
    }

    #[test]
    fn alexnet_first_convolution() {
        let pipeline = Topology::AlexNet.build().unwrap();

        let conv1 = pipeline.get("conv1").unwrap();
        assert_eq!(conv1.output_shape(), TensorShape::image(128, 128, 11, 11));
        assert_eq!(
            pipeline.get("pool1").unwrap().output_shape(),
            TensorShape::image(128, 128, 6, 6)
        );
        assert_eq!(
            pipeline.get("flatten1").unwrap().output_shape(),
            TensorShape::flat(128, 256 * 3 * 3)
        );
    }

    #[test]
    fn vgg_reduces_to_a_single_pixel() {
        for topology in [Topology::Vgg9, Topology::Vgg16] {
            let pipeline = topology.build().unwrap();
            assert_eq!(
                pipeline.get("flatten1").unwrap().output_shape(),
                TensorShape::flat(128, 512)
            );
        }

        let convs = |t: Topology| {
            t.build()
                .unwrap()
                .layers()
                .iter()
                .filter(|l| matches!(l.kind(), LayerKind::Conv2d { .. }))
                .count()
        };
        assert_eq!(convs(Topology::Vgg9), 8);
        assert_eq!(convs(Topology::Vgg16), 13);
    }

    #[test]
    fn minionn_and_lenet_differ_in_widths_only() {
        let minionn = Topology::MiniOnn.build().unwrap();
        let lenet = Topology::LeNet.build().unwrap();

        assert_eq!(
            minionn.get("flatten1").unwrap().output_shape(),
            TensorShape::flat(128, 16 * 11 * 11)
        );
        assert_eq!(
            lenet.get("flatten1").unwrap().output_shape(),
            TensorShape::flat(128, 50 * 11 * 11)
        );
        assert_eq!(minionn.len(), lenet.len());
    }

    #[test]
    fn sarda_even_filter_with_explicit_padding() {
        let pipeline = Topology::Sarda.build().unwrap();
        assert_eq!(
            pipeline.get("conv1").unwrap().output_shape(),
            TensorShape::image(128, 5, 35, 35)
        );
    }

    #[test]
    fn two_builds_are_independent_and_identical() {
        let a = Topology::LeNet.build().unwrap();
        let b = Topology::LeNet.build().unwrap();

        let shapes = |p: &Pipeline| -> Vec<_> {
            p.layers()
                .iter()
                .map(|l| (l.input_shape(), l.output_shape()))
                .collect()
        };
        assert_eq!(shapes(&a), shapes(&b));
        assert_eq!(a, b);
        assert!(!std::ptr::eq(a.layers().as_ptr(), b.layers().as_ptr()));
    }

    #[test]
    fn overrides_replace_the_defaults() {
        let spec: ArchSpec = serde_json::from_str(
            r#"{ "topology": { "name": "minionn", "overrides": { "batch_size": 4, "widths": [2, 3] } } }"#,
        )
        .unwrap();

        let pipeline = spec.build().unwrap();
        assert_eq!(pipeline.batch_size(), Some(4));
        assert_eq!(
            pipeline.get("conv2").unwrap().output_shape(),
            TensorShape::image(4, 3, 22, 22)
        );
    }

    #[test]
    fn wrong_stage_count_is_a_configuration_error() {
        let mut hyper = Topology::Vgg9.hyper();
        hyper.widths.pop();
        assert!(matches!(
            Topology::Vgg9.recipe(&hyper),
            Err(NnErr::Configuration { .. })
        ));
    }

    #[test]
    fn too_small_images_are_rejected_before_execution() {
        let mut hyper = Topology::Vgg9.hyper();
        hyper.image_size = 8;
        assert!(Topology::Vgg9.recipe(&hyper).unwrap().build().is_err());
    }
}
