//! Input decoding. Gzip and zip run on blocking threads over a
//! [`SyncIoBridge`]; decoded chunks come back through a channel and are
//! exposed again as an `AsyncRead`.
//!
//! Zip input is spooled to an anonymous temporary file first. Entry sizes may
//! only be recorded in data descriptors or the central directory, which a
//! forward-only reader cannot see.

use crate::pipeline::Compression;
use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use futures::stream;
use std::fs::File;
use std::io::{self, Read};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::debug;
use zip::ZipArchive;
use zip::result::ZipResult;

const DECODE_CHUNK_SIZE: usize = 64 * 1024;
const DECODE_CHANNEL_DEPTH: usize = 8;

pub type InputReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Error, Debug)]
pub enum DecompressError {
    #[error("Zip archive does not contain any file")]
    NoContent,
    #[error("Invalid zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("I/O error while decoding input: {0}")]
    Io(#[from] io::Error),
    #[error("Decoder thread stopped before reporting")]
    DecoderGone,
}

impl DecompressError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DecompressError::Io(_) | DecompressError::DecoderGone)
    }
}

/// Wraps `reader` so it yields decoded bytes.
///
/// Must be called from within a tokio runtime. For zip input this waits until
/// the archive is spooled and the first non-empty file entry is located, so
/// an archive without content fails here rather than mid-run.
pub async fn open_input<R>(reader: R, compression: Compression) -> Result<InputReader, DecompressError>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    match compression {
        Compression::None => Ok(Box::new(reader)),
        Compression::Gzip => {
            let (chunks, output) = channel_reader();
            let bridge = SyncIoBridge::new(reader);
            tokio::task::spawn_blocking(move || {
                let mut decoder = MultiGzDecoder::new(bridge);
                pump(&mut decoder, &chunks);
            });
            Ok(output)
        }
        Compression::Zip => {
            let (chunks, output) = channel_reader();
            let (ready_tx, ready_rx) = oneshot::channel();
            let bridge = SyncIoBridge::new(reader);
            tokio::task::spawn_blocking(move || stream_first_entry(bridge, ready_tx, &chunks));
            ready_rx.await.map_err(|_| DecompressError::DecoderGone)??;
            Ok(output)
        }
    }
}

type ChunkSender = mpsc::Sender<io::Result<Bytes>>;

fn channel_reader() -> (ChunkSender, InputReader) {
    let (tx, rx) = mpsc::channel(DECODE_CHANNEL_DEPTH);
    let chunks = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    (tx, Box::new(StreamReader::new(Box::pin(chunks))))
}

/// Copies `reader` into the channel until EOF, an error or a dropped receiver.
fn pump(reader: &mut impl Read, chunks: &ChunkSender) {
    let mut buf = vec![0u8; DECODE_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                if chunks
                    .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                let _ = chunks.blocking_send(Err(e));
                return;
            }
        }
    }
}

fn stream_first_entry<R: Read>(
    input: R,
    ready: oneshot::Sender<Result<(), DecompressError>>,
    chunks: &ChunkSender,
) {
    let mut archive = match spool_archive(input) {
        Ok(archive) => archive,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let index = match first_entry_with_content(&mut archive) {
        Ok(Some(index)) => index,
        Ok(None) => {
            let _ = ready.send(Err(DecompressError::NoContent));
            return;
        }
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    let mut entry = match archive.by_index(index) {
        Ok(entry) => entry,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    debug!(entry = entry.name(), size = entry.size(), "Streaming zip entry");
    if ready.send(Ok(())).is_ok() {
        pump(&mut entry, chunks);
    }
}

fn spool_archive<R: Read>(mut input: R) -> Result<ZipArchive<File>, DecompressError> {
    let mut spool = tempfile::tempfile()?;
    let spooled = io::copy(&mut input, &mut spool)?;
    debug!(bytes = spooled, "Zip input spooled");
    Ok(ZipArchive::new(spool)?)
}

/// Index of the first file entry that has a name and a non-zero size.
fn first_entry_with_content(archive: &mut ZipArchive<File>) -> ZipResult<Option<usize>> {
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        if !entry.is_dir() && !entry.name().is_empty() && entry.size() > 0 {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression as Level;
    use flate2::write::GzEncoder;
    use std::io::{Cursor, Write};
    use tokio::io::AsyncReadExt;
    use zip::write::SimpleFileOptions;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Level::fast());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            if name.ends_with('/') {
                writer
                    .add_directory(*name, SimpleFileOptions::default())
                    .unwrap();
            } else {
                writer
                    .start_file(*name, SimpleFileOptions::default())
                    .unwrap();
                writer.write_all(data).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    async fn read_all(mut reader: InputReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_plain_input_passes_through() {
        let reader = open_input(Cursor::new(b"a\nb\n".to_vec()), Compression::None)
            .await
            .unwrap();
        assert_eq!(read_all(reader).await, b"a\nb\n");
    }

    #[tokio::test]
    async fn test_gzip_input_is_decoded() {
        let payload: Vec<u8> = (0..20_000).flat_map(|i| format!("row-{i}\n").into_bytes()).collect();
        let reader = open_input(Cursor::new(gzip(&payload)), Compression::Gzip)
            .await
            .unwrap();
        assert_eq!(read_all(reader).await, payload);
    }

    #[tokio::test]
    async fn test_corrupt_gzip_surfaces_as_read_error() {
        let mut reader = open_input(Cursor::new(b"not gzip at all".to_vec()), Compression::Gzip)
            .await
            .unwrap();
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn test_zip_uses_first_entry_with_content() {
        let archive = zip_archive(&[
            ("logs/", b""),
            ("empty.csv", b""),
            ("data.csv", b"h\n1\n2\n"),
            ("ignored.csv", b"x\n"),
        ]);
        let reader = open_input(Cursor::new(archive), Compression::Zip)
            .await
            .unwrap();
        assert_eq!(read_all(reader).await, b"h\n1\n2\n");
    }

    /// Builds a single stored entry the way forward-only writers do: flag
    /// bit 3 set, zero sizes in the local header and the real values in a
    /// trailing data descriptor and the central directory.
    fn zip_with_data_descriptor(name: &str, data: &[u8]) -> Vec<u8> {
        let mut crc = flate2::Crc::new();
        crc.update(data);
        let crc = crc.sum();
        let size = data.len() as u32;
        let name_len = name.len() as u16;
        let mut out = Vec::new();

        out.extend_from_slice(&0x0403_4b50_u32.to_le_bytes());
        for field in [20u16, 0x0008, 0, 0, 0x0021] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        for field in [0u32, 0, 0] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out.extend_from_slice(&name_len.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(data);
        for field in [0x0807_4b50_u32, crc, size, size] {
            out.extend_from_slice(&field.to_le_bytes());
        }

        let central_offset = out.len() as u32;
        out.extend_from_slice(&0x0201_4b50_u32.to_le_bytes());
        for field in [20u16, 20, 0x0008, 0, 0, 0x0021] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        for field in [crc, size, size] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        for field in [name_len, 0, 0, 0, 0] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        for field in [0u32, 0] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out.extend_from_slice(name.as_bytes());
        let central_size = out.len() as u32 - central_offset;

        out.extend_from_slice(&0x0605_4b50_u32.to_le_bytes());
        for field in [0u16, 0, 1, 1] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        for field in [central_size, central_offset] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    #[tokio::test]
    async fn test_zip_with_trailing_data_descriptor_is_read() {
        let archive = zip_with_data_descriptor("-", b"h\na,b\nc,d\n");
        let reader = open_input(Cursor::new(archive), Compression::Zip)
            .await
            .unwrap();
        assert_eq!(read_all(reader).await, b"h\na,b\nc,d\n");
    }

    #[tokio::test]
    async fn test_truncated_zip_is_rejected() {
        let mut archive = zip_archive(&[("data.csv", b"h\n1\n")]);
        archive.truncate(archive.len() / 2);
        let result = open_input(Cursor::new(archive), Compression::Zip).await;
        assert!(matches!(result, Err(DecompressError::Zip(_))));
    }

    #[tokio::test]
    async fn test_zip_without_content_fails_before_reading() {
        let archive = zip_archive(&[("only-dir/", b""), ("empty.txt", b"")]);
        let result = open_input(Cursor::new(archive), Compression::Zip).await;
        assert!(matches!(result, Err(DecompressError::NoContent)));
    }
}
