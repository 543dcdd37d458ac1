use std::io::{Read, Write};

use anyhow::{Context, Error};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use vbk_api_types::CompressionFormat;

pub const DEFAULT_GZIP_LEVEL: u32 = 6;

/// Compression applied to the collector stream on the producer side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamCompression {
    None,
    Gzip(u32),
    Zstd,
}

impl StreamCompression {
    pub fn for_format(format: CompressionFormat, level: Option<u32>) -> Self {
        match format {
            CompressionFormat::Tar => StreamCompression::None,
            CompressionFormat::Gz => {
                StreamCompression::Gzip(level.unwrap_or(DEFAULT_GZIP_LEVEL).clamp(1, 9))
            }
            CompressionFormat::Zst => StreamCompression::Zstd,
        }
    }
}

/// A writer whose compressor has to be finalized to flush trailing frames.
pub trait FinishWriter: Write + Send {
    fn finish(self: Box<Self>) -> Result<(), Error>;
}

struct Passthrough<W: Write + Send>(W);

impl<W: Write + Send> Write for Passthrough<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write + Send> FinishWriter for Passthrough<W> {
    fn finish(mut self: Box<Self>) -> Result<(), Error> {
        self.0.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> FinishWriter for GzEncoder<W> {
    fn finish(self: Box<Self>) -> Result<(), Error> {
        let mut inner = GzEncoder::finish(*self).context("finishing gzip stream failed")?;
        inner.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> FinishWriter for zstd::stream::write::Encoder<'static, W> {
    fn finish(self: Box<Self>) -> Result<(), Error> {
        let mut inner =
            zstd::stream::write::Encoder::finish(*self).context("finishing zstd stream failed")?;
        inner.flush()?;
        Ok(())
    }
}

/// Wrap `writer` in the chosen compressor. Zstd uses the library default
/// level.
pub fn compress_writer<W: Write + Send + 'static>(
    writer: W,
    compression: StreamCompression,
) -> Result<Box<dyn FinishWriter>, Error> {
    match compression {
        StreamCompression::None => Ok(Box::new(Passthrough(writer))),
        StreamCompression::Gzip(level) => Ok(Box::new(GzEncoder::new(
            writer,
            Compression::new(level.clamp(1, 9)),
        ))),
        StreamCompression::Zstd => {
            let encoder =
                zstd::stream::write::Encoder::new(writer, 0).context("zstd encoder setup failed")?;
            Ok(Box::new(encoder))
        }
    }
}

/// Wrap `reader` in the decompressor matching the archive key suffix.
pub fn decompress_reader<'a, R: Read + 'a>(
    reader: R,
    archive_key: &str,
) -> Result<Box<dyn Read + 'a>, Error> {
    match CompressionFormat::from_archive_key(archive_key) {
        CompressionFormat::Tar => Ok(Box::new(reader)),
        CompressionFormat::Gz => Ok(Box::new(GzDecoder::new(reader))),
        CompressionFormat::Zst => {
            let decoder =
                zstd::stream::read::Decoder::new(reader).context("zstd decoder setup failed")?;
            Ok(Box::new(decoder))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(compression: StreamCompression, key: &str) {
        let input = b"hello compression world".repeat(100);

        // FinishWriter consumes itself, so collect through a shared buffer
        let buf = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut writer = compress_writer(SharedSink(buf.clone()), compression).unwrap();
        writer.write_all(&input).unwrap();
        writer.finish().unwrap();
        let compressed = buf.lock().unwrap().clone();

        if compression != StreamCompression::None {
            assert_ne!(compressed, input);
        }

        let mut decompressed = Vec::new();
        decompress_reader(&compressed[..], key)
            .unwrap()
            .read_to_end(&mut decompressed)
            .unwrap();
        assert_eq!(decompressed, input);
    }

    #[derive(Clone)]
    struct SharedSink(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_gzip_roundtrip() {
        roundtrip(StreamCompression::Gzip(6), "x.tar.gz");
    }

    #[test]
    fn test_zstd_roundtrip() {
        roundtrip(StreamCompression::Zstd, "x.tar.zst");
    }

    #[test]
    fn test_passthrough_roundtrip() {
        roundtrip(StreamCompression::None, "x.tar");
    }

    #[test]
    fn test_level_defaults() {
        assert_eq!(
            StreamCompression::for_format(CompressionFormat::Gz, None),
            StreamCompression::Gzip(6)
        );
        assert_eq!(
            StreamCompression::for_format(CompressionFormat::Gz, Some(42)),
            StreamCompression::Gzip(9)
        );
        assert_eq!(
            StreamCompression::for_format(CompressionFormat::Tar, Some(3)),
            StreamCompression::None
        );
    }
}
