//! Persisted trace files for `write_into_file` sessions.
//!
//! The file is the framed chunk sequence in ingestion order, no
//! reordering. Each frame is:
//!
//! ```text
//! [u32-le body length][u32-le crc32(body)][body]
//! body = [u8 frame kind][content]
//!   kind 0: content = 16-byte sanitized chunk header + chunk payload
//!   kind 1: content = bincode(ServiceMetadata)   (the optional footer)
//! ```
//!
//! The crc covers torn tails from a crashed service: [`read_trace_file`]
//! stops cleanly at the first frame that fails its checksum.

use crate::records::ServiceMetadata;
use chunkring::CHUNK_HEADER_LEN;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

const FRAME_CHUNK: u8 = 0;
const FRAME_FOOTER: u8 = 1;

/// Append-only writer for a session's output file.
pub struct FileSink {
    writer: BufWriter<File>,
    path: PathBuf,
    chunks_written: u64,
}

impl FileSink {
    /// Creates (truncating) the output file.
    pub async fn create(path: impl AsRef<Path>) -> io::Result<FileSink> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;
        Ok(FileSink {
            writer: BufWriter::new(file),
            path,
            chunks_written: 0,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn chunks_written(&self) -> u64 {
        self.chunks_written
    }

    async fn write_frame(&mut self, kind: u8, parts: &[&[u8]]) -> io::Result<()> {
        let body_len = 1 + parts.iter().map(|p| p.len()).sum::<usize>();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[kind]);
        for part in parts {
            hasher.update(part);
        }
        self.writer.write_all(&(body_len as u32).to_le_bytes()).await?;
        self.writer.write_all(&hasher.finalize().to_le_bytes()).await?;
        self.writer.write_all(&[kind]).await?;
        for part in parts {
            self.writer.write_all(part).await?;
        }
        Ok(())
    }

    /// Appends one ingested chunk.
    pub async fn append_chunk(
        &mut self,
        header_raw: &[u8; CHUNK_HEADER_LEN],
        payload: &[u8],
    ) -> io::Result<()> {
        self.write_frame(FRAME_CHUNK, &[header_raw, payload]).await?;
        self.chunks_written += 1;
        Ok(())
    }

    /// Pushes buffered frames to the OS. Driven by the session's
    /// `file_write_period_ms` timer.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }

    /// Writes the footer (a copy of the last metadata record) and closes.
    pub async fn finish(mut self, footer: &ServiceMetadata) -> io::Result<()> {
        let body = bincode::serialize(footer)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.write_frame(FRAME_FOOTER, &[&body]).await?;
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await
    }
}

/// Everything recovered from a persisted trace file.
#[derive(Debug, Default)]
pub struct TraceFileContents {
    pub chunks: Vec<([u8; CHUNK_HEADER_LEN], Vec<u8>)>,
    pub footer: Option<ServiceMetadata>,
}

/// Reads a trace file back: the offline re-ingestion half of the format.
/// Stops at the first torn or corrupt frame rather than failing, so a
/// crashed service still leaves a readable prefix.
pub async fn read_trace_file(path: impl AsRef<Path>) -> io::Result<TraceFileContents> {
    let data = tokio::fs::read(path).await?;
    let mut contents = TraceFileContents::default();
    let mut pos = 0;

    while pos + 8 <= data.len() {
        let body_len = u32::from_le_bytes(data[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        let crc = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().expect("4 bytes"));
        let body_start = pos + 8;
        if body_len == 0 || body_start + body_len > data.len() {
            break; // torn tail
        }
        let body = &data[body_start..body_start + body_len];
        if crc32fast::hash(body) != crc {
            tracing::warn!(offset = pos, "trace file frame failed checksum; stopping");
            break;
        }
        match body[0] {
            FRAME_CHUNK if body.len() >= 1 + CHUNK_HEADER_LEN => {
                let mut header = [0u8; CHUNK_HEADER_LEN];
                header.copy_from_slice(&body[1..=CHUNK_HEADER_LEN]);
                contents
                    .chunks
                    .push((header, body[1 + CHUNK_HEADER_LEN..].to_vec()));
            }
            FRAME_FOOTER => {
                contents.footer = bincode::deserialize(&body[1..]).ok();
            }
            _ => break, // unknown frame kind: stop, do not guess
        }
        pos = body_start + body_len;
    }

    Ok(contents)
}
