use super::{Activation, LayerKind, LayerOp, LayerSpec, TableBuilder};

const FILTERS: [usize; 5] = [64, 128, 256, 512, 512];

/// Plain VGG: `convs[b]` 3x3 ReLU convolutions then a 2x2 max pool per block.
pub(super) fn specs(input_channels: usize, convs: &[usize; 5]) -> Vec<LayerSpec> {
    let mut table = TableBuilder::new(input_channels);

    for (block, (&filters, &n)) in FILTERS.iter().zip(convs).enumerate() {
        let block = block + 1;

        for conv in 1..=n {
            let op = LayerOp::Conv {
                in_channels: table.channels(),
                out_channels: filters,
                kernel: 3,
                stride: 1,
                input_norm: false,
                norm: false,
                activation: Activation::Relu,
            };
            table.push(
                format!("block{block}_conv{conv}"),
                LayerKind::Convolution,
                op,
                filters,
                1,
            );
        }

        let op = LayerOp::MaxPool {
            kernel: 2,
            stride: 2,
            padding: 0,
        };
        table.push(format!("block{block}_pool"), LayerKind::MaxPool, op, filters, 2);
    }

    table.finish()
}
