use burn::prelude::*;
use tracing::{debug, info};

use super::{
    ModelError,
    backbone::{Backbone, BackboneConfig, BackboneKind, LayerRef, LayerTable},
    blocks::{
        DecoderBlock, DecoderBlockConfig, DecoderBlockType, OutputActivation, OutputBlock,
        OutputBlockConfig,
    },
    plan::{FeatureShape, StagePlan, ensure_full_resolution, upsample_stage, wrap_index},
};

#[derive(Config, Debug)]
pub struct XNetConfig {
    #[config(default = "BackboneKind::Vgg16")]
    pub backbone: BackboneKind,
    #[config(default = "3")]
    pub input_channels: usize,
    #[config(default = "1")]
    pub num_classes: usize,
    #[config(default = "OutputActivation::Sigmoid")]
    pub activation: OutputActivation,
    /// Skip layers, deepest first, optionally followed by as many
    /// down-sampling layers. The backbone defaults are used when unset.
    #[config(default = "None")]
    pub skip_connections: Option<Vec<LayerRef>>,
    #[config(default = "DecoderBlockType::Upsampling")]
    pub decoder_block_type: DecoderBlockType,
    #[config(default = "vec![256, 128, 64, 32, 16]")]
    pub decoder_filters: Vec<usize>,
    #[config(default = "true")]
    pub decoder_use_batchnorm: bool,
    #[config(default = "5")]
    pub n_upsample_blocks: usize,
    #[config(default = "false")]
    pub encoder_freeze: bool,
}

/// Where a lattice node reads its input from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeInput {
    /// Output of a backbone layer.
    Layer(usize),
    /// Another lattice cell.
    Cell(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodePlan {
    pub row: usize,
    pub col: usize,
    pub cell: usize,
    pub input: NodeInput,
    /// Cells concatenated after up-sampling, empty when any of them is empty.
    pub skip_cells: Vec<usize>,
    pub stage: StagePlan,
}

/// Nested skip lattice of width `n_upsample_blocks + 1`.
///
/// Cell `width * row + col` holds the features of row `row` (scale
/// `2^row`) after `col` decoder nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XNetPlan {
    pub width: usize,
    pub skip_layers: Vec<usize>,
    pub down_layers: Vec<usize>,
    /// `downterm[k]` feeds the first node of row `k - 1`.
    pub downterm: Vec<Option<usize>>,
    /// Backbone layers placed into the lattice before decoding.
    pub seeds: Vec<(usize, usize)>,
    /// Nodes in evaluation order.
    pub nodes: Vec<NodePlan>,
    pub output_cell: usize,
    pub output_channels: usize,
}

impl XNetPlan {
    pub fn node(&self, row: usize, col: usize) -> Option<&NodePlan> {
        self.nodes
            .iter()
            .find(|node| node.row == row && node.col == col)
    }
}

impl XNetConfig {
    pub fn backbone_config(&self) -> BackboneConfig {
        BackboneConfig::new(self.backbone.clone()).with_input_channels(self.input_channels)
    }

    pub fn skip_connection_layers(&self) -> Vec<LayerRef> {
        self.skip_connections
            .clone()
            .unwrap_or_else(|| self.backbone.default_xnet_skip_connections())
    }

    pub fn plan(&self, table: &LayerTable) -> Result<XNetPlan, ModelError> {
        let n = self.n_upsample_blocks;
        if n == 0 || self.decoder_filters.is_empty() {
            return Err(ModelError::InvalidConfig(
                "x-net needs at least one up-sampling block and one decoder filter".to_string(),
            ));
        }
        let width = n + 1;
        let depth = n as isize;

        let layers = self.skip_connection_layers();
        let (skip_refs, down_refs) = if layers.len() > n {
            let half = layers.len() / 2;
            (&layers[..half], &layers[half..])
        } else {
            (&layers[..], &layers[..])
        };
        let skip_layers = table.resolve_all(skip_refs)?;
        let down_layers = table.resolve_all(down_refs)?;
        let output = table.output_index();

        let mut downterm = vec![None; width];
        let pooled_output = down_layers.first() == Some(&output);
        for (i, &layer) in down_layers.iter().enumerate() {
            let slot = if pooled_output {
                depth - i as isize
            } else {
                depth - i as isize - 1
            };
            downterm[wrap_index(slot, width)?] = Some(layer);
        }
        downterm[n] = Some(output);

        let mut cells: Vec<Option<FeatureShape>> = vec![None; width * width];
        let mut seeds = Vec::with_capacity(skip_layers.len() + 1);
        for (i, &layer) in skip_layers.iter().enumerate() {
            let cell = wrap_index(width as isize * (depth - 1 - i as isize), width * width)?;
            cells[cell] = Some(FeatureShape::of_layer(table, layer));
            seeds.push((cell, layer));
        }
        cells[width * n] = Some(FeatureShape::of_layer(table, output));
        seeds.push((width * n, output));

        let mut nodes = Vec::new();
        for j in 0..n {
            for i in 0..n - j {
                let cell = width * i + j + 1;
                cells[cell] = None;

                if i == 0 && j < n - 1 && skip_layers.len() < n {
                    continue;
                }

                let (input, input_shape, skip_cells) = if j == 0 {
                    let Some(layer) = downterm[i + 1] else {
                        continue;
                    };
                    (
                        NodeInput::Layer(layer),
                        FeatureShape::of_layer(table, layer),
                        vec![width * i],
                    )
                } else {
                    let source = width * (i + 1) + j;
                    let shape = cells[source].ok_or(ModelError::MissingLatticeNode {
                        row: i + 1,
                        col: j,
                    })?;
                    (NodeInput::Cell(source), shape, (width * i..=width * i + j).collect())
                };

                let skips: Option<Vec<FeatureShape>> =
                    skip_cells.iter().map(|&skip| cells[skip]).collect();
                let (skip_cells, skip_shapes) = match skips {
                    Some(shapes) => (skip_cells, shapes),
                    None => (Vec::new(), Vec::new()),
                };

                let filters = self.decoder_filters
                    [wrap_index(depth - i as isize - 2, self.decoder_filters.len())?];
                let stage = upsample_stage(
                    &format!("x-net node {}-{}", i + 1, j + 1),
                    input_shape,
                    &skip_shapes,
                    filters,
                )?;

                cells[cell] = Some(stage.output());
                nodes.push(NodePlan {
                    row: i,
                    col: j + 1,
                    cell,
                    input,
                    skip_cells,
                    stage,
                });
            }
        }

        let output_shape = cells[n].ok_or(ModelError::MissingLatticeNode { row: 0, col: n })?;
        ensure_full_resolution("x-net", output_shape)?;

        Ok(XNetPlan {
            width,
            skip_layers,
            down_layers,
            downterm,
            seeds,
            nodes,
            output_cell: n,
            output_channels: output_shape.channels,
        })
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<XNet<B>, ModelError> {
        info!("Building X-Net on {}", self.backbone.name());

        let backbone_config = self.backbone_config();
        let plan = self.plan(&backbone_config.table())?;
        debug!(nodes = plan.nodes.len(), "X-Net lattice planned");

        let mut taps: Vec<usize> = Vec::new();
        let mut slot_of = |layer: usize| match taps.iter().position(|&tap| tap == layer) {
            Some(slot) => slot,
            None => {
                taps.push(layer);
                taps.len() - 1
            }
        };

        let mut seed_cells = Vec::with_capacity(plan.seeds.len());
        let mut seed_slots = Vec::with_capacity(plan.seeds.len());
        for &(cell, layer) in &plan.seeds {
            seed_cells.push(cell);
            seed_slots.push(slot_of(layer));
        }

        let nodes = plan
            .nodes
            .iter()
            .map(|node| {
                let (source, from_tap) = match node.input {
                    NodeInput::Layer(layer) => (slot_of(layer), true),
                    NodeInput::Cell(cell) => (cell, false),
                };

                LatticeNode {
                    block: DecoderBlockConfig::new(
                        node.stage.input_channels,
                        node.stage.skip_channels,
                        node.stage.filters,
                    )
                    .with_block_type(self.decoder_block_type.clone())
                    .with_use_batchnorm(self.decoder_use_batchnorm)
                    .init(device),
                    cell: node.cell,
                    source,
                    from_tap,
                    skip_cells: node.skip_cells.clone(),
                }
            })
            .collect();

        let mut backbone = backbone_config.init(device);
        if self.encoder_freeze {
            backbone = backbone.freeze();
        }

        let final_block = OutputBlockConfig::new(plan.output_channels, self.num_classes)
            .with_kernel_size(3)
            .with_activation(self.activation.clone())
            .init(device);
        info!(nodes = plan.nodes.len(), "X-Net initialized");

        Ok(XNet {
            backbone,
            taps,
            seed_cells,
            seed_slots,
            nodes,
            lattice_size: plan.width * plan.width,
            output_cell: plan.output_cell,
            final_block,
            num_classes: self.num_classes,
        })
    }
}

#[derive(Module, Debug)]
pub struct LatticeNode<B: Backend> {
    block: DecoderBlock<B>,
    cell: usize,
    /// Tap slot when `from_tap`, lattice cell otherwise.
    source: usize,
    from_tap: bool,
    skip_cells: Vec<usize>,
}

#[derive(Module, Debug)]
pub struct XNet<B: Backend> {
    backbone: Backbone<B>,
    taps: Vec<usize>,
    seed_cells: Vec<usize>,
    seed_slots: Vec<usize>,
    nodes: Vec<LatticeNode<B>>,
    lattice_size: usize,
    output_cell: usize,
    final_block: OutputBlock<B>,
    num_classes: usize,
}

impl<B: Backend> XNet<B> {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let (_, tapped) = self.backbone.forward_taps(images, &self.taps);

        let mut cells: Vec<Option<Tensor<B, 4>>> = vec![None; self.lattice_size];
        for (&cell, &slot) in self.seed_cells.iter().zip(&self.seed_slots) {
            cells[cell] = Some(tapped[slot].clone());
        }

        for node in &self.nodes {
            let x = if node.from_tap {
                tapped[node.source].clone()
            } else {
                cells[node.source]
                    .clone()
                    .expect("Lattice inputs are planned before their consumers")
            };
            let skips = node
                .skip_cells
                .iter()
                .map(|&cell| {
                    cells[cell]
                        .clone()
                        .expect("Skip cells are planned before their consumers")
                })
                .collect();

            cells[node.cell] = Some(node.block.forward(x, skips));
        }

        let x = cells[self.output_cell]
            .take()
            .expect("The output cell is always planned");

        self.final_block.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn plan(config: &XNetConfig) -> Result<XNetPlan, ModelError> {
        config.plan(&config.backbone_config().table())
    }

    #[test]
    fn vgg16_lattice_is_complete() {
        let config = XNetConfig::new();
        let table = config.backbone_config().table();
        let plan = config.plan(&table).unwrap();

        assert_eq!(plan.nodes.len(), 15);
        assert_eq!(plan.output_cell, 5);
        assert_eq!(plan.output_channels, 32);

        let name = |layer: Option<usize>| layer.map(|l| table.layers()[l].name.clone());
        assert_eq!(name(plan.downterm[1]).as_deref(), Some("block1_pool"));
        assert_eq!(name(plan.downterm[4]).as_deref(), Some("block4_pool"));
        assert_eq!(name(plan.downterm[5]).as_deref(), Some("block5_pool"));

        let first = plan.node(0, 1).unwrap();
        assert_eq!(first.skip_cells, vec![0]);
        assert_eq!(first.stage.skip_channels, 64);

        let deepest = plan.node(4, 1).unwrap();
        assert_eq!(deepest.input, NodeInput::Layer(table.output_index()));
        assert_eq!(deepest.stage.filters, 16);

        let last = plan.node(0, 5).unwrap();
        assert_eq!(last.input, NodeInput::Cell(10));
        assert_eq!(last.skip_cells, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn resnet_lattice_leaves_top_row_empty() {
        let config = XNetConfig::new().with_backbone(BackboneKind::ResNet18);
        let table = config.backbone_config().table();
        let plan = config.plan(&table).unwrap();

        assert_eq!(plan.skip_layers.len(), 4);
        assert_eq!(plan.down_layers.len(), 4);
        assert_eq!(plan.downterm[1], None);
        assert_eq!(
            table.layers()[plan.downterm[2].unwrap()].name,
            "stage1_unit2_relu1"
        );
        assert_eq!(plan.nodes.len(), 11);
        assert!(plan.node(0, 1).is_none());

        let last = plan.node(0, 5).unwrap();
        assert!(last.skip_cells.is_empty());
        assert_eq!(last.stage.skip_channels, 0);
    }

    #[test]
    fn efficientnet_uses_skips_as_down_layers() {
        let config = XNetConfig::new().with_backbone(BackboneKind::EfficientNetB0);
        let table = config.backbone_config().table();
        let plan = config.plan(&table).unwrap();

        assert_eq!(plan.skip_layers, plan.down_layers);
        assert_eq!(
            table.layers()[plan.downterm[4].unwrap()].name,
            "block6a_expand_activation"
        );
        assert_eq!(
            table.layers()[plan.downterm[1].unwrap()].name,
            "block2a_expand_activation"
        );
        assert!(plan.node(0, 1).is_none());
        assert_eq!(plan.nodes.len(), 11);
    }

    #[test]
    fn all_backbones_plan() {
        for kind in BackboneKind::ALL {
            let config = XNetConfig::new().with_backbone(kind.clone());
            assert!(plan(&config).is_ok(), "{}", kind.name());
        }
    }

    #[test]
    fn short_filter_list_wraps_from_the_end() {
        let config = XNetConfig::new().with_decoder_filters(vec![128, 64, 32, 16]);
        let plan = plan(&config).unwrap();

        // Row `i` takes filter `depth - i - 2`; the deepest row reads index -1.
        assert_eq!(plan.node(0, 1).unwrap().stage.filters, 16);
        assert_eq!(plan.node(3, 1).unwrap().stage.filters, 128);
        assert_eq!(plan.node(4, 1).unwrap().stage.filters, 16);
    }

    #[test]
    fn filter_index_past_the_list_is_rejected() {
        let config = XNetConfig::new().with_decoder_filters(vec![32, 16]);

        assert_eq!(
            plan(&config),
            Err(ModelError::WrappedIndex { index: 3, len: 2 })
        );
    }

    #[test]
    fn skip_list_longer_than_the_lattice_wraps_into_the_bottom_row() {
        // Ten layers on a four-row lattice: the fifth skip wraps to the cell
        // the backbone output then takes, leaving row 0 at half resolution.
        let config = XNetConfig::new()
            .with_n_upsample_blocks(4)
            .with_decoder_filters(vec![128, 64, 32, 16]);

        assert_eq!(config.skip_connection_layers().len(), 10);
        assert_eq!(
            plan(&config),
            Err(ModelError::OutputScale {
                model: "x-net",
                level: 1
            })
        );
    }

    #[test]
    fn mismatched_skip_is_rejected() {
        let config = XNetConfig::new().with_skip_connections(Some(vec![
            LayerRef::from("block4_conv3"),
            LayerRef::from("block4_conv3"),
            LayerRef::from("block3_conv3"),
            LayerRef::from("block2_conv2"),
            LayerRef::from("block1_conv2"),
        ]));

        assert!(matches!(
            plan(&config),
            Err(ModelError::ScaleMismatch { .. })
        ));
    }

    #[test]
    fn forward_keeps_input_resolution() {
        let device = Default::default();
        let model = XNetConfig::new()
            .with_backbone(BackboneKind::ResNet18)
            .with_num_classes(2)
            .with_activation(OutputActivation::Softmax)
            .with_decoder_filters(vec![16, 8, 8, 4, 4])
            .init::<TestBackend>(&device)
            .unwrap();
        let images = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);

        assert_eq!(model.forward(images).dims(), [1, 2, 32, 32]);
    }
}
