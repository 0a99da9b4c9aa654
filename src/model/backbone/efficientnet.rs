use super::{Activation, LayerKind, LayerOp, LayerSpec, TableBuilder};

struct StageArgs {
    kernel: usize,
    repeats: usize,
    filters_in: usize,
    filters_out: usize,
    expand_ratio: usize,
    stride: usize,
}

const fn stage(
    kernel: usize,
    repeats: usize,
    filters_in: usize,
    filters_out: usize,
    expand_ratio: usize,
    stride: usize,
) -> StageArgs {
    StageArgs {
        kernel,
        repeats,
        filters_in,
        filters_out,
        expand_ratio,
        stride,
    }
}

const STAGES: [StageArgs; 7] = [
    stage(3, 1, 32, 16, 1, 1),
    stage(3, 2, 16, 24, 6, 2),
    stage(5, 2, 24, 40, 6, 2),
    stage(3, 3, 40, 80, 6, 2),
    stage(5, 3, 80, 112, 6, 1),
    stage(5, 4, 112, 192, 6, 2),
    stage(3, 1, 192, 320, 6, 1),
];

const SE_RATIO: f64 = 0.25;
const DIVISOR: f64 = 8.0;

pub(super) fn round_filters(filters: usize, width: f64) -> usize {
    let filters = filters as f64 * width;
    let mut rounded = (((filters + DIVISOR / 2.0) / DIVISOR).floor() * DIVISOR).max(DIVISOR);
    if rounded < 0.9 * filters {
        rounded += DIVISOR;
    }
    rounded as usize
}

pub(super) fn round_repeats(repeats: usize, depth: f64) -> usize {
    (repeats as f64 * depth).ceil() as usize
}

/// EfficientNet scaled by `width` and `depth`.
pub(super) fn specs(input_channels: usize, width: f64, depth: f64) -> Vec<LayerSpec> {
    let mut table = TableBuilder::new(input_channels);

    let stem_channels = round_filters(32, width);
    let stem = LayerOp::Conv {
        in_channels: input_channels,
        out_channels: stem_channels,
        kernel: 3,
        stride: 2,
        input_norm: false,
        norm: true,
        activation: Activation::Swish,
    };
    table.push("stem_activation", LayerKind::Activation, stem, stem_channels, 2);

    for (index, args) in STAGES.iter().enumerate() {
        let filters_out = round_filters(args.filters_out, width);

        for repeat in 0..round_repeats(args.repeats, depth) {
            let prefix = format!("block{}{}", index + 1, (b'a' + repeat as u8) as char);
            let filters_in = table.channels();
            let stride = if repeat == 0 { args.stride } else { 1 };
            let expanded = filters_in * args.expand_ratio;

            if args.expand_ratio != 1 {
                let op = LayerOp::Expand {
                    in_channels: filters_in,
                    out_channels: expanded,
                };
                table.push(
                    format!("{prefix}_expand_activation"),
                    LayerKind::Activation,
                    op,
                    expanded,
                    1,
                );
            }

            let residual = stride == 1 && filters_in == filters_out;
            let op = LayerOp::MbConv {
                in_channels: filters_in,
                expanded,
                out_channels: filters_out,
                kernel: args.kernel,
                stride,
                se_channels: ((filters_in as f64 * SE_RATIO) as usize).max(1),
            };
            let (name, kind) = if residual {
                (format!("{prefix}_add"), LayerKind::Merge)
            } else {
                (format!("{prefix}_project_bn"), LayerKind::Norm)
            };
            table.push(name, kind, op, filters_out, stride);
        }
    }

    let top_channels = round_filters(1280, width);
    let top = LayerOp::Conv {
        in_channels: table.channels(),
        out_channels: top_channels,
        kernel: 1,
        stride: 1,
        input_norm: false,
        norm: true,
        activation: Activation::Swish,
    };
    table.push("top_activation", LayerKind::Activation, top, top_channels, 1);

    table.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_round_to_multiples_of_eight() {
        assert_eq!(round_filters(32, 1.0), 32);
        assert_eq!(round_filters(32, 1.2), 40);
        assert_eq!(round_filters(1280, 1.4), 1792);
        assert_eq!(round_filters(24, 1.1), 24);
        assert_eq!(round_repeats(3, 1.4), 5);
        assert_eq!(round_repeats(1, 1.0), 1);
    }

    #[test]
    fn b3_block_names() {
        let specs = specs(3, 1.2, 1.4);
        let names: Vec<_> = specs.iter().map(|s| s.info.name.as_str()).collect();
        assert!(names.contains(&"block1b_add"));
        assert!(names.contains(&"block6f_add"));
        assert!(!names.contains(&"block1a_expand_activation"));
        assert_eq!(names.last(), Some(&"top_activation"));
    }
}
