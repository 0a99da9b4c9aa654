//! `tf.train.Example` messages and serialized tensors.

use std::collections::HashMap;

use prost::Message;

use super::record::RecordError;

#[derive(Clone, PartialEq, Message)]
pub struct Example {
    #[prost(message, optional, tag = "1")]
    pub features: Option<Features>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Features {
    #[prost(map = "string, message", tag = "1")]
    pub feature: HashMap<String, Feature>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Feature {
    #[prost(oneof = "Kind", tags = "1, 2, 3")]
    pub kind: Option<Kind>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Kind {
    #[prost(message, tag = "1")]
    BytesList(BytesList),
    #[prost(message, tag = "2")]
    FloatList(FloatList),
    #[prost(message, tag = "3")]
    Int64List(Int64List),
}

#[derive(Clone, PartialEq, Message)]
pub struct BytesList {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub value: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FloatList {
    #[prost(float, repeated, tag = "1")]
    pub value: Vec<f32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Int64List {
    #[prost(int64, repeated, tag = "1")]
    pub value: Vec<i64>,
}

impl Feature {
    pub fn bytes(value: Vec<u8>) -> Self {
        Feature {
            kind: Some(Kind::BytesList(BytesList { value: vec![value] })),
        }
    }

    pub fn float(value: f32) -> Self {
        Feature {
            kind: Some(Kind::FloatList(FloatList { value: vec![value] })),
        }
    }

    pub fn int64(value: i64) -> Self {
        Feature {
            kind: Some(Kind::Int64List(Int64List { value: vec![value] })),
        }
    }
}

impl Example {
    pub fn from_features<K: Into<String>>(features: impl IntoIterator<Item = (K, Feature)>) -> Self {
        Example {
            features: Some(Features {
                feature: features
                    .into_iter()
                    .map(|(key, feature)| (key.into(), feature))
                    .collect(),
            }),
        }
    }

    pub fn decode_from(payload: &[u8]) -> Result<Self, RecordError> {
        Ok(Example::decode(payload)?)
    }

    fn feature(&self, key: &str) -> Result<&Feature, RecordError> {
        self.features
            .as_ref()
            .and_then(|features| features.feature.get(key))
            .ok_or_else(|| RecordError::MissingFeature(key.to_string()))
    }

    /// First value of a bytes feature.
    pub fn bytes(&self, key: &str) -> Result<&[u8], RecordError> {
        match &self.feature(key)?.kind {
            Some(Kind::BytesList(list)) => list
                .value
                .first()
                .map(Vec::as_slice)
                .ok_or_else(|| RecordError::MissingFeature(key.to_string())),
            _ => Err(RecordError::FeatureType {
                key: key.to_string(),
                expected: "bytes",
            }),
        }
    }

    pub fn float(&self, key: &str) -> Result<f32, RecordError> {
        match &self.feature(key)?.kind {
            Some(Kind::FloatList(list)) => list
                .value
                .first()
                .copied()
                .ok_or_else(|| RecordError::MissingFeature(key.to_string())),
            _ => Err(RecordError::FeatureType {
                key: key.to_string(),
                expected: "float",
            }),
        }
    }

    pub fn int64(&self, key: &str) -> Result<i64, RecordError> {
        match &self.feature(key)?.kind {
            Some(Kind::Int64List(list)) => list
                .value
                .first()
                .copied()
                .ok_or_else(|| RecordError::MissingFeature(key.to_string())),
            _ => Err(RecordError::FeatureType {
                key: key.to_string(),
                expected: "int64",
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum DataType {
    Invalid = 0,
    Float = 1,
    Double = 2,
    Int32 = 3,
    Uint8 = 4,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeProto {
    #[prost(message, repeated, tag = "2")]
    pub dim: Vec<Dim>,
    #[prost(bool, tag = "3")]
    pub unknown_rank: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct Dim {
    #[prost(int64, tag = "1")]
    pub size: i64,
    #[prost(string, tag = "2")]
    pub name: String,
}

/// The subset of `tensorflow.TensorProto` written by `tf.io.serialize_tensor`
/// for dense numeric tensors.
#[derive(Clone, PartialEq, Message)]
pub struct TensorProto {
    #[prost(enumeration = "DataType", tag = "1")]
    pub dtype: i32,
    #[prost(message, optional, tag = "2")]
    pub tensor_shape: Option<TensorShapeProto>,
    #[prost(int32, tag = "3")]
    pub version_number: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub tensor_content: Vec<u8>,
    #[prost(float, repeated, tag = "5")]
    pub float_val: Vec<f32>,
    #[prost(double, repeated, tag = "6")]
    pub double_val: Vec<f64>,
    #[prost(int32, repeated, tag = "7")]
    pub int_val: Vec<i32>,
}

/// Element storage of a decoded tensor.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorValues {
    U8(Vec<u8>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl TensorValues {
    pub fn len(&self) -> usize {
        match self {
            TensorValues::U8(values) => values.len(),
            TensorValues::F32(values) => values.len(),
            TensorValues::F64(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dtype(&self) -> DataType {
        match self {
            TensorValues::U8(_) => DataType::Uint8,
            TensorValues::F32(_) => DataType::Float,
            TensorValues::F64(_) => DataType::Double,
        }
    }
}

/// Number of elements of `shape`, or an error when it overflows.
fn element_count(shape: &[usize]) -> Result<usize, RecordError> {
    shape
        .iter()
        .try_fold(1usize, |count, &dim| count.checked_mul(dim))
        .ok_or_else(|| RecordError::Tensor(format!("shape {shape:?} is too large")))
}

/// A dense row-major tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct RawTensor {
    pub shape: Vec<usize>,
    pub values: TensorValues,
}

impl RawTensor {
    pub fn new(shape: Vec<usize>, values: TensorValues) -> Result<Self, RecordError> {
        let expected = element_count(&shape)?;
        if expected != values.len() {
            return Err(RecordError::Tensor(format!(
                "shape {shape:?} needs {expected} values, got {}",
                values.len()
            )));
        }
        Ok(Self { shape, values })
    }

    /// Values as `u8`; float tensors are rounded and clamped to `0..=255`.
    pub fn to_u8(&self) -> Vec<u8> {
        match &self.values {
            TensorValues::U8(values) => values.clone(),
            TensorValues::F32(values) => values
                .iter()
                .map(|v| v.round().clamp(0.0, 255.0) as u8)
                .collect(),
            TensorValues::F64(values) => values
                .iter()
                .map(|v| v.round().clamp(0.0, 255.0) as u8)
                .collect(),
        }
    }

    pub fn to_f32(&self) -> Vec<f32> {
        match &self.values {
            TensorValues::U8(values) => values.iter().map(|&v| v as f32).collect(),
            TensorValues::F32(values) => values.clone(),
            TensorValues::F64(values) => values.iter().map(|&v| v as f32).collect(),
        }
    }
}

/// Encodes a tensor the way `tf.io.serialize_tensor` does: dtype, shape and
/// little-endian `tensor_content`.
pub fn serialize_tensor(tensor: &RawTensor) -> Vec<u8> {
    let tensor_content = match &tensor.values {
        TensorValues::U8(values) => values.clone(),
        TensorValues::F32(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorValues::F64(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
    };

    TensorProto {
        dtype: tensor.values.dtype() as i32,
        tensor_shape: Some(TensorShapeProto {
            dim: tensor
                .shape
                .iter()
                .map(|&size| Dim {
                    size: size as i64,
                    name: String::new(),
                })
                .collect(),
            unknown_rank: false,
        }),
        tensor_content,
        ..Default::default()
    }
    .encode_to_vec()
}

fn from_le<const N: usize, T>(bytes: &[u8], convert: fn([u8; N]) -> T) -> Vec<T> {
    bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut buf = [0u8; N];
            buf.copy_from_slice(chunk);
            convert(buf)
        })
        .collect()
}

/// Fills a tensor from the typed `*_val` fields, which hold either every
/// element or a single value broadcast over the shape.
/// Broadcasts are capped at [`MAX_BROADCAST`] elements.
fn expand<T: Clone>(values: &[T], len: usize) -> Result<Vec<T>, RecordError> {
    match values {
        [single] if len <= MAX_BROADCAST => Ok(vec![single.clone(); len]),
        [_] => Err(RecordError::Tensor(format!(
            "refusing to broadcast one value over {len} elements"
        ))),
        _ => Ok(values.to_vec()),
    }
}

/// Largest tensor filled from a single broadcast value.
const MAX_BROADCAST: usize = 1 << 28;

/// Decodes the output of `tf.io.serialize_tensor` for uint8, float32 and
/// float64 tensors.
pub fn parse_tensor(bytes: &[u8]) -> Result<RawTensor, RecordError> {
    let proto = TensorProto::decode(bytes)?;
    let shape = proto
        .tensor_shape
        .as_ref()
        .map(|shape| {
            shape
                .dim
                .iter()
                .map(|dim| usize::try_from(dim.size))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()
        .map_err(|_| RecordError::Tensor("negative dimension".to_string()))?
        .unwrap_or_default();
    let len = element_count(&shape)?;
    let packed = !proto.tensor_content.is_empty();

    let values = match DataType::try_from(proto.dtype) {
        Ok(DataType::Uint8) if packed => TensorValues::U8(proto.tensor_content),
        Ok(DataType::Uint8) => TensorValues::U8(
            expand(&proto.int_val, len)?
                .into_iter()
                .map(|v| v as u8)
                .collect(),
        ),
        Ok(DataType::Float) if packed => {
            TensorValues::F32(from_le(&proto.tensor_content, f32::from_le_bytes))
        }
        Ok(DataType::Float) => TensorValues::F32(expand(&proto.float_val, len)?),
        Ok(DataType::Double) if packed => {
            TensorValues::F64(from_le(&proto.tensor_content, f64::from_le_bytes))
        }
        Ok(DataType::Double) => TensorValues::F64(expand(&proto.double_val, len)?),
        _ => {
            return Err(RecordError::Tensor(format!(
                "unsupported dtype {}",
                proto.dtype
            )));
        }
    };

    RawTensor::new(shape, values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_features_survive_encoding() {
        let example = Example::from_features([
            ("image/height", Feature::int64(4)),
            ("label", Feature::float(1.0)),
            ("image", Feature::bytes(vec![1, 2, 3])),
        ]);
        let decoded = Example::decode_from(&example.encode_to_vec()).unwrap();

        assert_eq!(decoded.int64("image/height").unwrap(), 4);
        assert_eq!(decoded.float("label").unwrap(), 1.0);
        assert_eq!(decoded.bytes("image").unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn missing_and_mistyped_features() {
        let example = Example::from_features([("label", Feature::float(0.0))]);

        assert!(matches!(
            example.bytes("image"),
            Err(RecordError::MissingFeature(key)) if key == "image"
        ));
        assert!(matches!(
            example.int64("label"),
            Err(RecordError::FeatureType { expected: "int64", .. })
        ));
    }

    #[test]
    fn serialized_tensor_layout() {
        let tensor = RawTensor::new(vec![1, 2], TensorValues::F32(vec![1.0, -2.0])).unwrap();
        let proto = TensorProto::decode(serialize_tensor(&tensor).as_slice()).unwrap();

        assert_eq!(proto.dtype, DataType::Float as i32);
        assert_eq!(proto.tensor_content.len(), 8);
        assert_eq!(&proto.tensor_content[..4], &1.0f32.to_le_bytes());
        assert_eq!(parse_tensor(&proto.encode_to_vec()).unwrap(), tensor);
    }

    fn shape(dims: &[i64]) -> Option<TensorShapeProto> {
        Some(TensorShapeProto {
            dim: dims
                .iter()
                .map(|&size| Dim {
                    size,
                    name: String::new(),
                })
                .collect(),
            unknown_rank: false,
        })
    }

    #[test]
    fn scalar_fields_broadcast() {
        let proto = TensorProto {
            dtype: DataType::Uint8 as i32,
            tensor_shape: shape(&[2, 2]),
            int_val: vec![7],
            ..Default::default()
        };
        let tensor = parse_tensor(&proto.encode_to_vec()).unwrap();

        assert_eq!(tensor.shape, vec![2, 2]);
        assert_eq!(tensor.values, TensorValues::U8(vec![7; 4]));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let proto = TensorProto {
            dtype: DataType::Double as i32,
            tensor_shape: shape(&[3]),
            tensor_content: 1.0f64.to_le_bytes().to_vec(),
            ..Default::default()
        };

        assert!(matches!(
            parse_tensor(&proto.encode_to_vec()),
            Err(RecordError::Tensor(_))
        ));
    }

    #[test]
    fn malformed_shapes_are_rejected() {
        let malformed = [
            shape(&[4, -1]),
            shape(&[i64::MAX, i64::MAX, 4]),
            shape(&[1 << 20, 1 << 20]),
        ];

        for tensor_shape in malformed {
            let proto = TensorProto {
                dtype: DataType::Float as i32,
                tensor_shape,
                float_val: vec![0.5],
                ..Default::default()
            };
            assert!(matches!(
                parse_tensor(&proto.encode_to_vec()),
                Err(RecordError::Tensor(_))
            ));
        }
    }

    #[test]
    fn garbage_is_not_a_tensor() {
        assert!(matches!(
            parse_tensor(&[0xff, 0xff, 0xff]),
            Err(RecordError::Decode(_))
        ));
    }
}
