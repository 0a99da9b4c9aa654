//! TFRecord container files.
//!
//! Each record is framed as
//!
//! ```text
//! u64 length (little endian)
//! u32 masked crc32c of the length bytes
//! [u8; length] payload
//! u32 masked crc32c of the payload
//! ```
//!
//! A zlib-compressed file is the same stream wrapped in a single zlib
//! stream.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use burn::config::Config;
use flate2::{Compression as ZlibLevel, read::ZlibDecoder, write::ZlibEncoder};
use thiserror::Error;

const MASK_DELTA: u32 = 0xa282_ead8;
const HEADER_LEN: usize = 12;
const FOOTER_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Stream(#[from] io::Error),
    #[error("record truncated after {read} of {expected} bytes")]
    Truncated { read: usize, expected: usize },
    #[error("record length {len} exceeds the {available} bytes left")]
    Oversized { len: u64, available: u64 },
    #[error("corrupted record {what}: checksum {found:#010x}, expected {expected:#010x}")]
    Checksum {
        what: &'static str,
        expected: u32,
        found: u32,
    },
    #[error("invalid protobuf payload: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("feature `{0}` is missing")]
    MissingFeature(String),
    #[error("feature `{key}` is not a {expected} list")]
    FeatureType { key: String, expected: &'static str },
    #[error("invalid tensor: {0}")]
    Tensor(String),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl RecordError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        RecordError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Compression applied to a whole record file.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zlib,
}

impl std::str::FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "zlib" => Ok(Compression::Zlib),
            other => Err(format!("unknown record compression `{other}`")),
        }
    }
}

/// The checksum TFRecord stores: crc32c rotated right by 15 bits plus a
/// constant.
pub fn masked_crc(bytes: &[u8]) -> u32 {
    let crc = crc32c::crc32c(bytes);
    crc.rotate_right(15).wrapping_add(MASK_DELTA)
}

/// Position of one record's payload inside an uncompressed file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordSpan {
    pub offset: u64,
    pub len: usize,
}

/// Reads `buf.len()` bytes, or returns `Ok(false)` on a clean end of stream
/// before the first byte.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, RecordError> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) if read == 0 => return Ok(false),
            Ok(0) => {
                return Err(RecordError::Truncated {
                    read,
                    expected: buf.len(),
                });
            }
            Ok(n) => read += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}

fn check(what: &'static str, bytes: &[u8], expected: u32) -> Result<(), RecordError> {
    let found = masked_crc(bytes);
    if found != expected {
        return Err(RecordError::Checksum {
            what,
            expected,
            found,
        });
    }
    Ok(())
}

/// Streams record payloads out of any reader.
///
/// The length checksum is always checked, so a corrupt header never turns
/// into an allocation. `verify` only controls the payload checksum.
pub struct RecordReader<R> {
    reader: R,
    verify: bool,
    position: u64,
    limit: Option<u64>,
}

impl RecordReader<Box<dyn Read + Send>> {
    /// Opens a record file, decompressing it when needed.
    ///
    /// Plain files are limited to their size on disk.
    pub fn open(path: &Path, compression: Compression) -> Result<Self, RecordError> {
        let file = File::open(path).map_err(|err| RecordError::io(path, err))?;
        let total = file
            .metadata()
            .map_err(|err| RecordError::io(path, err))?
            .len();
        let file = BufReader::new(file);
        let reader: Box<dyn Read + Send> = match compression {
            Compression::None => Box::new(file),
            Compression::Zlib => Box::new(BufReader::new(ZlibDecoder::new(file))),
        };

        let reader = RecordReader::new(reader);
        Ok(match compression {
            Compression::None => reader.limit(total),
            Compression::Zlib => reader,
        })
    }
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            verify: true,
            position: 0,
            limit: None,
        }
    }

    /// Enables or disables payload checksum verification.
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Total size of the stream, when known; longer records are rejected
    /// before reading them.
    pub fn limit(mut self, total: u64) -> Self {
        self.limit = Some(total);
        self
    }

    /// Next record with the offset of its payload in the decompressed
    /// stream, or `None` at the end of the stream.
    pub fn next_record(&mut self) -> Result<Option<(RecordSpan, Vec<u8>)>, RecordError> {
        let mut header = [0u8; HEADER_LEN];
        if !read_exact_or_eof(&mut self.reader, &mut header)? {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 8];
        length_bytes.copy_from_slice(&header[..8]);
        check("length", &length_bytes, u32::from_le_bytes(crc_bytes(&header[8..])))?;
        let len = u64::from_le_bytes(length_bytes);

        let framing = (HEADER_LEN + FOOTER_LEN) as u64;
        let available = match self.limit {
            Some(total) => total.saturating_sub(self.position + framing),
            None => u64::MAX,
        };
        let expected = usize::try_from(len)
            .ok()
            .filter(|_| len <= available)
            .ok_or(RecordError::Oversized { len, available })?;

        // Sized by the bytes actually read.
        let mut payload = Vec::new();
        let read = (&mut self.reader).take(len).read_to_end(&mut payload)?;
        if read < expected {
            return Err(RecordError::Truncated { read, expected });
        }
        let mut footer = [0u8; FOOTER_LEN];
        if !read_exact_or_eof(&mut self.reader, &mut footer)? {
            return Err(RecordError::Truncated {
                read: 0,
                expected: FOOTER_LEN,
            });
        }
        if self.verify {
            check("payload", &payload, u32::from_le_bytes(footer))?;
        }

        let span = RecordSpan {
            offset: self.position + HEADER_LEN as u64,
            len: expected,
        };
        self.position += framing + len;

        Ok(Some((span, payload)))
    }
}

fn crc_bytes(bytes: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[..4]);
    out
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Vec<u8>, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record()
            .transpose()
            .map(|record| record.map(|(_, payload)| payload))
    }
}

/// Payload spans of every record in an uncompressed file.
///
/// Payload checksums are left to [`read_record_at`].
pub fn index_records(path: &Path) -> Result<Vec<RecordSpan>, RecordError> {
    let mut reader = RecordReader::open(path, Compression::None)?.verify(false);
    let mut spans = Vec::new();
    while let Some((span, _)) = reader.next_record()? {
        spans.push(span);
    }
    Ok(spans)
}

/// Reads one payload out of an uncompressed file.
pub fn read_record_at(path: &Path, span: RecordSpan) -> Result<Vec<u8>, RecordError> {
    let mut file = File::open(path).map_err(|err| RecordError::io(path, err))?;
    file.seek(SeekFrom::Start(span.offset))
        .map_err(|err| RecordError::io(path, err))?;

    let mut payload = vec![0u8; span.len];
    let mut footer = [0u8; FOOTER_LEN];
    file.read_exact(&mut payload)
        .and_then(|_| file.read_exact(&mut footer))
        .map_err(|err| RecordError::io(path, err))?;
    check("payload", &payload, u32::from_le_bytes(footer))?;

    Ok(payload)
}

/// Random access to the records of a set of files.
///
/// Uncompressed files are indexed and read lazily. A zlib stream cannot be
/// seeked, so compressed files are decompressed into memory once.
pub enum RecordSource {
    Indexed(Vec<(PathBuf, RecordSpan)>),
    Loaded(Vec<Vec<u8>>),
}

impl RecordSource {
    pub fn open(files: &[PathBuf], compression: Compression) -> Result<Self, RecordError> {
        match compression {
            Compression::None => {
                let mut entries = Vec::new();
                for path in files {
                    let spans = index_records(path)?;
                    entries.extend(spans.into_iter().map(|span| (path.clone(), span)));
                }
                Ok(RecordSource::Indexed(entries))
            }
            Compression::Zlib => {
                let mut payloads = Vec::new();
                for path in files {
                    for payload in RecordReader::open(path, compression)? {
                        payloads.push(payload?);
                    }
                }
                Ok(RecordSource::Loaded(payloads))
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RecordSource::Indexed(entries) => entries.len(),
            RecordSource::Loaded(payloads) => payloads.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload(&self, index: usize) -> Option<Result<Vec<u8>, RecordError>> {
        match self {
            RecordSource::Indexed(entries) => entries
                .get(index)
                .map(|(path, span)| read_record_at(path, *span)),
            RecordSource::Loaded(payloads) => payloads.get(index).cloned().map(Ok),
        }
    }
}

enum Sink<W: Write> {
    Plain(W),
    Zlib(ZlibEncoder<W>),
}

/// Appends framed records to a writer.
pub struct RecordWriter<W: Write> {
    sink: Sink<W>,
    written: usize,
}

impl RecordWriter<BufWriter<File>> {
    pub fn create(path: &Path, compression: Compression) -> Result<Self, RecordError> {
        let file = File::create(path).map_err(|err| RecordError::io(path, err))?;
        Ok(RecordWriter::new(BufWriter::new(file), compression))
    }
}

impl<W: Write> RecordWriter<W> {
    pub fn new(writer: W, compression: Compression) -> Self {
        let sink = match compression {
            Compression::None => Sink::Plain(writer),
            Compression::Zlib => Sink::Zlib(ZlibEncoder::new(writer, ZlibLevel::default())),
        };
        Self { sink, written: 0 }
    }

    pub fn write_record(&mut self, payload: &[u8]) -> Result<(), RecordError> {
        let length = (payload.len() as u64).to_le_bytes();
        let writer: &mut dyn Write = match &mut self.sink {
            Sink::Plain(writer) => writer,
            Sink::Zlib(encoder) => encoder,
        };

        writer.write_all(&length)?;
        writer.write_all(&masked_crc(&length).to_le_bytes())?;
        writer.write_all(payload)?;
        writer.write_all(&masked_crc(payload).to_le_bytes())?;
        self.written += 1;
        Ok(())
    }

    /// Number of records written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flushes and returns the underlying writer.
    pub fn finish(self) -> Result<W, RecordError> {
        let mut writer = match self.sink {
            Sink::Plain(writer) => writer,
            Sink::Zlib(encoder) => encoder.finish()?,
        };
        writer.flush()?;
        Ok(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(records: &[&[u8]], compression: Compression) -> Vec<u8> {
        let mut writer = RecordWriter::new(Vec::new(), compression);
        for record in records {
            writer.write_record(record).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn masked_crc_of_empty_input() {
        // crc32c("") is 0, so only the mask constant remains.
        assert_eq!(masked_crc(b""), MASK_DELTA);
    }

    #[test]
    fn frame_layout() {
        let bytes = encode(&[b"abc"], Compression::None);

        assert_eq!(bytes.len(), HEADER_LEN + 3 + FOOTER_LEN);
        assert_eq!(&bytes[..8], &3u64.to_le_bytes());
        assert_eq!(&bytes[12..15], b"abc");
    }

    #[test]
    fn reads_back_plain_and_zlib() {
        for compression in [Compression::None, Compression::Zlib] {
            let bytes = encode(&[b"first", b"", b"third"], compression);
            let reader: Box<dyn Read> = match compression {
                Compression::None => Box::new(bytes.as_slice()),
                Compression::Zlib => Box::new(ZlibDecoder::new(bytes.as_slice())),
            };

            let records: Vec<Vec<u8>> = RecordReader::new(reader).map(Result::unwrap).collect();
            assert_eq!(records, vec![b"first".to_vec(), Vec::new(), b"third".to_vec()]);
        }
    }

    #[test]
    fn detects_corruption() {
        let mut bytes = encode(&[b"payload"], Compression::None);
        bytes[HEADER_LEN] ^= 0xff;

        let result = RecordReader::new(bytes.as_slice()).next().unwrap();
        assert!(matches!(
            result,
            Err(RecordError::Checksum {
                what: "payload",
                ..
            })
        ));

        let unchecked = RecordReader::new(bytes.as_slice()).verify(false).next().unwrap();
        assert!(unchecked.is_ok());
    }

    #[test]
    fn detects_truncation() {
        let bytes = encode(&[b"payload"], Compression::None);
        let result = RecordReader::new(&bytes[..bytes.len() - 2]).next().unwrap();

        assert!(matches!(result, Err(RecordError::Truncated { .. })));
    }

    #[test]
    fn corrupt_length_is_not_trusted() {
        let mut bytes = u64::MAX.to_le_bytes().to_vec();
        bytes.extend([0; 4]);
        bytes.extend(b"garbage");

        let result = RecordReader::new(bytes.as_slice()).verify(false).next().unwrap();
        assert!(matches!(
            result,
            Err(RecordError::Checksum {
                what: "length",
                ..
            })
        ));
    }

    #[test]
    fn huge_length_with_valid_checksum_is_truncated() {
        let length = (u64::MAX / 2).to_le_bytes();
        let mut bytes = length.to_vec();
        bytes.extend(masked_crc(&length).to_le_bytes());
        bytes.extend(b"garbage");

        let result = RecordReader::new(bytes.as_slice()).next().unwrap();
        assert!(matches!(result, Err(RecordError::Truncated { read: 7, .. })));
    }

    #[test]
    fn indexing_rejects_lengths_past_the_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.tfrecords");

        std::fs::write(&path, [u64::MAX.to_le_bytes().as_slice(), &[0; 4], b"garbage"].concat())
            .unwrap();
        assert!(index_records(&path).is_err());

        let length = 1000u64.to_le_bytes();
        let header = [length.as_slice(), &masked_crc(&length).to_le_bytes(), b"garbage"].concat();
        std::fs::write(&path, header).unwrap();
        assert!(matches!(
            index_records(&path),
            Err(RecordError::Oversized {
                len: 1000,
                available: 3,
            })
        ));
    }

    #[test]
    fn zlib_shard_read_as_plain_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.tfrecords");
        std::fs::write(&path, encode(&[b"one", b"two"], Compression::Zlib)).unwrap();

        assert!(index_records(&path).is_err());
    }

    #[test]
    fn spans_locate_payloads_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.tfrecords");
        let mut writer = RecordWriter::create(&path, Compression::None).unwrap();
        writer.write_record(b"one").unwrap();
        writer.write_record(b"second").unwrap();
        writer.finish().unwrap();

        let spans = index_records(&path).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].offset, (HEADER_LEN + 3 + FOOTER_LEN + HEADER_LEN) as u64);
        assert_eq!(read_record_at(&path, spans[1]).unwrap(), b"second");
    }
}
