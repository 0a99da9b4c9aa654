use anyhow::{Result, bail};
use burn::{backend::NdArray, prelude::*};
use clap::Args;
use stroke_seg::{BackboneKind, DoubleUNetConfig, ModelError, XNetConfig};
use tracing::{error, info};

#[derive(Args)]
pub struct CheckArgs {
    /// Also build every model and run a forward pass at this input size.
    #[arg(long)]
    pub forward: Option<usize>,

    #[arg(long, default_value_t = 3)]
    pub classes: usize,
}

fn check_backbone(kind: &BackboneKind, args: &CheckArgs) -> Result<(), ModelError> {
    let double_unet = DoubleUNetConfig::new()
        .with_backbone(kind.clone())
        .with_num_classes(args.classes);
    let xnet = XNetConfig::new()
        .with_backbone(kind.clone())
        .with_num_classes(args.classes);

    let table = double_unet.backbone_config().table();
    let plan = double_unet.plan(&table)?;
    let lattice = xnet.plan(&table)?;
    info!(
        "{}: {} layers, double u-net center block {}, x-net {} nodes",
        kind.name(),
        table.len(),
        plan.center_block,
        lattice.nodes.len()
    );

    if let Some(size) = args.forward {
        let device = Default::default();
        let images = Tensor::<NdArray, 4>::zeros([1, 3, size, size], &device);

        let output = double_unet.init::<NdArray>(&device)?.forward(images.clone());
        info!("{}: double u-net output {:?}", kind.name(), output.dims());
        let output = xnet.init::<NdArray>(&device)?.forward(images);
        info!("{}: x-net output {:?}", kind.name(), output.dims());
    }

    Ok(())
}

pub fn run(args: &CheckArgs) -> Result<()> {
    let mut failures = 0;

    for kind in BackboneKind::ALL.iter() {
        info!("Trying backbone {}", kind.name());
        match check_backbone(kind, args) {
            Ok(()) => info!("No error in backbone {}", kind.name()),
            Err(err) => {
                error!("Backbone {} failed: {err}", kind.name());
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{failures} backbone(s) failed");
    }
    Ok(())
}
