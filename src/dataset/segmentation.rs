use burn::{data::dataloader::batcher::Batcher, prelude::*};

use super::{
    RecordItem,
    example::{Example, Feature, RawTensor, TensorValues, parse_tensor, serialize_tensor},
    raster::Raster,
    record::RecordError,
};
use crate::model::Preprocessing;

pub const IMAGE_HEIGHT_KEY: &str = "image/height";
pub const IMAGE_WIDTH_KEY: &str = "image/width";
pub const IMAGE_DEPTH_KEY: &str = "image/depth";
pub const IMAGE_KEY: &str = "image/raw_image";
pub const LABEL_KEY: &str = "label/raw";

/// An RGB image and its one-hot mask, both `height x width x channels`.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentationItem {
    pub image: Raster<u8>,
    pub mask: Raster<f32>,
}

fn hwc(tensor: &RawTensor, what: &str) -> Result<[usize; 3], RecordError> {
    match tensor.shape.as_slice() {
        &[height, width] => Ok([height, width, 1]),
        &[height, width, channels] => Ok([height, width, channels]),
        shape => Err(RecordError::Tensor(format!(
            "{what} must be HW or HWC, got shape {shape:?}"
        ))),
    }
}

impl SegmentationItem {
    pub fn to_example(&self) -> Example {
        let image = RawTensor {
            shape: vec![self.image.height, self.image.width, self.image.channels],
            values: TensorValues::U8(self.image.data.clone()),
        };
        let label = RawTensor {
            shape: vec![self.mask.height, self.mask.width, self.mask.channels],
            values: TensorValues::F32(self.mask.data.clone()),
        };

        Example::from_features([
            (IMAGE_HEIGHT_KEY, Feature::int64(self.image.height as i64)),
            (IMAGE_WIDTH_KEY, Feature::int64(self.image.width as i64)),
            (IMAGE_DEPTH_KEY, Feature::int64(self.image.channels as i64)),
            (IMAGE_KEY, Feature::bytes(serialize_tensor(&image))),
            (LABEL_KEY, Feature::bytes(serialize_tensor(&label))),
        ])
    }
}

impl RecordItem for SegmentationItem {
    fn from_example(example: &Example) -> Result<Self, RecordError> {
        let image = parse_tensor(example.bytes(IMAGE_KEY)?)?;
        let label = parse_tensor(example.bytes(LABEL_KEY)?)?;
        let [height, width, channels] = hwc(&image, "image")?;
        let [mask_height, mask_width, classes] = hwc(&label, "label")?;

        if (height, width) != (mask_height, mask_width) {
            return Err(RecordError::Tensor(format!(
                "image is {height}x{width} but its mask is {mask_height}x{mask_width}"
            )));
        }

        Ok(SegmentationItem {
            image: Raster {
                height,
                width,
                channels,
                data: image.to_u8(),
            },
            mask: Raster {
                height,
                width,
                channels: classes,
                data: label.to_f32(),
            },
        })
    }
}

/// Builds `[batch, channels, height, width]` images with the backbone's
/// input normalisation and `[batch, classes, height, width]` masks.
#[derive(Clone)]
pub struct SegmentationBatcher<B: Backend> {
    device: B::Device,
    preprocessing: Preprocessing,
}

impl<B: Backend> SegmentationBatcher<B> {
    pub fn new(device: B::Device, preprocessing: Preprocessing) -> Self {
        Self {
            device,
            preprocessing,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SegmentationBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    /// One-hot float masks.
    pub masks: Tensor<B, 4>,
}

pub(crate) fn raster_tensor<B: Backend, T: super::raster::Pixel>(
    raster: &Raster<T>,
    device: &B::Device,
) -> Tensor<B, 3> {
    Tensor::<B, 3>::from_data(
        TensorData::new(
            raster.to_chw(),
            Shape::new([raster.channels, raster.height, raster.width]),
        )
        .convert::<B::FloatElem>(),
        device,
    )
}

impl<B: Backend> Batcher<SegmentationItem, SegmentationBatch<B>> for SegmentationBatcher<B> {
    fn batch(&self, items: Vec<SegmentationItem>) -> SegmentationBatch<B> {
        let mut images = Vec::with_capacity(items.len());
        let mut masks = Vec::with_capacity(items.len());

        for item in items {
            images.push(raster_tensor::<B, _>(&item.image, &self.device));
            masks.push(raster_tensor::<B, _>(&item.mask, &self.device));
        }

        let images = self.preprocessing.apply(Tensor::stack::<4>(images, 0));
        let masks = Tensor::stack::<4>(masks, 0);

        SegmentationBatch { images, masks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use prost::Message;

    type TestBackend = NdArray<f32>;

    fn item() -> SegmentationItem {
        SegmentationItem {
            image: Raster::new(2, 2, 3, (0..12).collect()).unwrap(),
            mask: Raster::new(2, 2, 2, vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0]).unwrap(),
        }
    }

    #[test]
    fn example_schema() {
        let example = item().to_example();

        assert_eq!(example.int64(IMAGE_HEIGHT_KEY).unwrap(), 2);
        assert_eq!(example.int64(IMAGE_DEPTH_KEY).unwrap(), 3);

        let decoded = Example::decode(example.encode_to_vec().as_slice()).unwrap();
        assert_eq!(SegmentationItem::from_example(&decoded).unwrap(), item());
    }

    #[test]
    fn mismatched_mask_is_rejected() {
        let mut bad = item();
        bad.mask = Raster::filled(1, 2, 2, 0.0);

        assert!(matches!(
            SegmentationItem::from_example(&bad.to_example()),
            Err(RecordError::Tensor(_))
        ));
    }

    #[test]
    fn batches_are_channels_first() {
        let device = Default::default();
        let batcher = SegmentationBatcher::<TestBackend>::new(device, Preprocessing::Identity);
        let batch = batcher.batch(vec![item(), item()]);

        assert_eq!(batch.images.dims(), [2, 3, 2, 2]);
        assert_eq!(batch.masks.dims(), [2, 2, 2, 2]);

        let red: Vec<f32> = batch
            .images
            .slice([0..1, 0..1])
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(red, vec![0.0, 3.0, 6.0, 9.0]);
    }
}
