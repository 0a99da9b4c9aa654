use super::{Activation, LayerKind, LayerOp, LayerSpec, TableBuilder};

const FILTERS: [usize; 4] = [64, 128, 256, 512];

/// Pre-activation ResNet with basic residual units.
///
/// Each unit exposes two layers: `stage{s}_unit{u}_relu1`, the batch-norm +
/// ReLU applied to the unit input, and `stage{s}_unit{u}_add`, the residual
/// sum. The first unit of every stage projects the shortcut and, past the
/// first stage, halves the resolution.
pub(super) fn specs(input_channels: usize, repetitions: &[usize; 4]) -> Vec<LayerSpec> {
    let mut table = TableBuilder::new(input_channels);

    let stem = LayerOp::Conv {
        in_channels: input_channels,
        out_channels: 64,
        kernel: 7,
        stride: 2,
        input_norm: true,
        norm: true,
        activation: Activation::Relu,
    };
    table.push("relu0", LayerKind::Activation, stem, 64, 2);

    let pool = LayerOp::MaxPool {
        kernel: 3,
        stride: 2,
        padding: 1,
    };
    table.push("pooling0", LayerKind::MaxPool, pool, 64, 2);

    for (stage, (&filters, &units)) in FILTERS.iter().zip(repetitions).enumerate() {
        for unit in 0..units {
            let prefix = format!("stage{}_unit{}", stage + 1, unit + 1);
            let in_channels = table.channels();

            let op = LayerOp::PreActivation {
                channels: in_channels,
            };
            table.push(format!("{prefix}_relu1"), LayerKind::Activation, op, in_channels, 1);

            let stride = if stage > 0 && unit == 0 { 2 } else { 1 };
            let op = LayerOp::Residual {
                in_channels,
                out_channels: filters,
                stride,
                projection: unit == 0,
            };
            table.push(format!("{prefix}_add"), LayerKind::Merge, op, filters, stride);
        }
    }

    let channels = table.channels();
    table.push(
        "relu1",
        LayerKind::Activation,
        LayerOp::PreActivation { channels },
        channels,
        1,
    );

    table.finish()
}
