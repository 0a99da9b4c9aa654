use burn::{data::dataloader::batcher::Batcher, prelude::*};

use super::{
    RecordItem,
    example::{Example, Feature, RawTensor, TensorValues, parse_tensor, serialize_tensor},
    raster::Raster,
    record::RecordError,
    segmentation::raster_tensor,
};
use crate::model::Preprocessing;

pub const IMAGE_KEY: &str = "image";
pub const LABEL_KEY: &str = "label";

/// An RGB image and its binary stroke label.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassificationItem {
    pub image: Raster<u8>,
    pub label: f32,
}

impl ClassificationItem {
    pub fn to_example(&self) -> Example {
        let image = RawTensor {
            shape: vec![self.image.height, self.image.width, self.image.channels],
            values: TensorValues::U8(self.image.data.clone()),
        };

        Example::from_features([
            (IMAGE_KEY, Feature::bytes(serialize_tensor(&image))),
            (LABEL_KEY, Feature::float(self.label)),
        ])
    }
}

impl RecordItem for ClassificationItem {
    fn from_example(example: &Example) -> Result<Self, RecordError> {
        let image = parse_tensor(example.bytes(IMAGE_KEY)?)?;
        let [height, width, channels] = match image.shape.as_slice() {
            &[height, width, channels] => [height, width, channels],
            shape => {
                return Err(RecordError::Tensor(format!(
                    "image must be HWC, got shape {shape:?}"
                )));
            }
        };

        Ok(ClassificationItem {
            image: Raster {
                height,
                width,
                channels,
                data: image.to_u8(),
            },
            label: example.float(LABEL_KEY)?,
        })
    }
}

#[derive(Clone)]
pub struct ClassificationBatcher<B: Backend> {
    device: B::Device,
    preprocessing: Preprocessing,
}

impl<B: Backend> ClassificationBatcher<B> {
    pub fn new(device: B::Device, preprocessing: Preprocessing) -> Self {
        Self {
            device,
            preprocessing,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClassificationBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    /// `0.0` or `1.0` per image.
    pub targets: Tensor<B, 1>,
}

impl<B: Backend> Batcher<ClassificationItem, ClassificationBatch<B>> for ClassificationBatcher<B> {
    fn batch(&self, items: Vec<ClassificationItem>) -> ClassificationBatch<B> {
        let labels: Vec<f32> = items.iter().map(|item| item.label).collect();
        let images = items
            .iter()
            .map(|item| raster_tensor::<B, _>(&item.image, &self.device))
            .collect();

        let images = self.preprocessing.apply(Tensor::stack::<4>(images, 0));
        let targets = Tensor::<B, 1>::from_data(
            TensorData::new(labels.clone(), [labels.len()]).convert::<B::FloatElem>(),
            &self.device,
        );

        ClassificationBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn item(label: f32) -> ClassificationItem {
        ClassificationItem {
            image: Raster::filled(4, 4, 3, 255),
            label,
        }
    }

    #[test]
    fn example_schema() {
        let example = item(1.0).to_example();

        assert_eq!(example.float(LABEL_KEY).unwrap(), 1.0);
        assert_eq!(ClassificationItem::from_example(&example).unwrap(), item(1.0));
    }

    #[test]
    fn batches_images_and_labels() {
        let batcher =
            ClassificationBatcher::<TestBackend>::new(Default::default(), Preprocessing::Torch);
        let batch = batcher.batch(vec![item(0.0), item(1.0), item(1.0)]);

        assert_eq!(batch.images.dims(), [3, 3, 4, 4]);
        assert_eq!(
            batch.targets.into_data().to_vec::<f32>().unwrap(),
            vec![0.0, 1.0, 1.0]
        );
    }
}
