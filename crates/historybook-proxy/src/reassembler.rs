//! Streaming response reassembly.
//!
//! A [`Reassembler`] follows one response through its `headers`, `chunk` and
//! `end` events. Selected responses are decoded incrementally into a bounded
//! buffer; everything else is left alone. The reassembler only observes the
//! stream: the client always receives the original bytes.

use std::collections::HashMap;
use std::io::{self, Write};

use flate2::write::{DeflateDecoder, GzDecoder, ZlibDecoder};
use thiserror::Error;

use crate::classifier::header;
use crate::error::ReassemblyError;

/// Default bound on a decoded body.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Longest accepted chunk-size or trailer line.
const MAX_LINE_LENGTH: usize = 4096;

/// Lifecycle of one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    /// Headers not seen yet.
    Idle,
    /// Accumulating and decoding body chunks.
    Buffering,
    /// Not captured; chunks are not looked at.
    PassThrough,
    /// The decoded body has been produced.
    Complete,
    /// A pass-through response has finished.
    Done,
}

/// Whether body chunks still carry chunked transfer framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFraming {
    /// Chunks are raw entity bytes.
    Decoded,
    /// Chunks carry `Transfer-Encoding: chunked` framing.
    ///
    /// For callers feeding raw wire bytes. The MITM handler receives bodies
    /// from hyper with the framing already removed and uses `Decoded`.
    Chunked,
}

impl TransferFraming {
    /// Framing announced by the `Transfer-Encoding` header of raw wire data.
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let chunked = header(headers, "transfer-encoding")
            .map(|value| {
                value
                    .split(',')
                    .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false);

        if chunked {
            Self::Chunked
        } else {
            Self::Decoded
        }
    }
}

#[derive(Debug)]
enum ChunkState {
    Size,
    Data(usize),
    DataCr,
    DataLf,
    Trailer,
    Done,
}

/// Incremental decoder for chunked transfer framing.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    line: Vec<u8>,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            line: Vec::new(),
        }
    }

    /// True once the terminal chunk and trailers have been read.
    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Decodes `input`, appending chunk payloads to `out`.
    pub fn decode(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> Result<(), ReassemblyError> {
        while !input.is_empty() {
            match self.state {
                ChunkState::Size | ChunkState::Trailer => {
                    let Some(line) = self.read_line(&mut input)? else {
                        return Ok(());
                    };
                    self.state = match self.state {
                        ChunkState::Size => match parse_chunk_size(&line)? {
                            0 => ChunkState::Trailer,
                            size => ChunkState::Data(size),
                        },
                        _ if line.is_empty() => ChunkState::Done,
                        _ => ChunkState::Trailer,
                    };
                }
                ChunkState::Data(remaining) => {
                    let take = remaining.min(input.len());
                    out.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    self.state = if take == remaining {
                        ChunkState::DataCr
                    } else {
                        ChunkState::Data(remaining - take)
                    };
                }
                ChunkState::DataCr => {
                    expect_byte(input[0], b'\r')?;
                    input = &input[1..];
                    self.state = ChunkState::DataLf;
                }
                ChunkState::DataLf => {
                    expect_byte(input[0], b'\n')?;
                    input = &input[1..];
                    self.state = ChunkState::Size;
                }
                ChunkState::Done => {
                    tracing::trace!("Ignoring {} bytes after terminal chunk", input.len());
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Consumes bytes up to a line feed. Returns the line without its
    /// terminator, or `None` if the line is still incomplete.
    fn read_line(&mut self, input: &mut &[u8]) -> Result<Option<String>, ReassemblyError> {
        let (consumed, complete) = match input.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (input.len(), false),
        };
        self.line.extend_from_slice(&input[..consumed]);
        *input = &input[consumed..];

        if self.line.len() > MAX_LINE_LENGTH {
            return Err(ReassemblyError::Framing("line too long".to_string()));
        }
        if !complete {
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&self.line)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.line.clear();
        Ok(Some(line))
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_chunk_size(line: &str) -> Result<usize, ReassemblyError> {
    let size = line.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(size, 16)
        .map_err(|_| ReassemblyError::Framing(format!("invalid chunk size {:?}", size)))
}

fn expect_byte(actual: u8, expected: u8) -> Result<(), ReassemblyError> {
    if actual == expected {
        Ok(())
    } else {
        Err(ReassemblyError::Framing(format!(
            "expected {:?} after chunk data, found {:?}",
            expected as char, actual as char
        )))
    }
}

/// Output sink that refuses to grow past `max_size` bytes.
///
/// The decompressors write through it, so an oversized body fails while it
/// is being inflated rather than after a whole frame has been expanded.
#[derive(Debug)]
struct BoundedBuffer {
    buf: Vec<u8>,
    max_size: usize,
}

#[derive(Debug, Error)]
#[error("decoded body exceeds the buffer bound")]
struct BufferFull;

impl BoundedBuffer {
    fn new(max_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_size,
        }
    }
}

impl Write for BoundedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.max_size {
            return Err(io::Error::other(BufferFull));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
enum Coding {
    Identity(BoundedBuffer),
    Gzip(GzDecoder<BoundedBuffer>),
    Zlib(ZlibDecoder<BoundedBuffer>),
    RawDeflate(DeflateDecoder<BoundedBuffer>),
    /// `deflate` before the first byte tells zlib from raw streams apart.
    Deflate,
}

/// Incremental content decoder with a bound on decoded bytes.
#[derive(Debug)]
pub struct ContentDecoder {
    coding: Coding,
    max_size: usize,
}

impl ContentDecoder {
    /// Creates a decoder for a `Content-Encoding` value.
    ///
    /// Supports `gzip`, `x-gzip`, `deflate` (zlib-wrapped or raw) and
    /// `identity`. Any other coding is an error.
    pub fn for_encoding(
        content_encoding: Option<&str>,
        max_size: usize,
    ) -> Result<Self, ReassemblyError> {
        let codings: Vec<String> = content_encoding
            .unwrap_or_default()
            .split(',')
            .map(|coding| coding.trim().to_ascii_lowercase())
            .filter(|coding| !coding.is_empty() && coding != "identity")
            .collect();

        let sink = BoundedBuffer::new(max_size);
        let coding = match codings.as_slice() {
            [] => Coding::Identity(sink),
            [single] => match single.as_str() {
                "gzip" | "x-gzip" => Coding::Gzip(GzDecoder::new(sink)),
                "deflate" => Coding::Deflate,
                other => return Err(ReassemblyError::UnsupportedCoding(other.to_string())),
            },
            _ => return Err(ReassemblyError::UnsupportedCoding(codings.join(", "))),
        };

        Ok(Self { coding, max_size })
    }

    /// Feeds encoded bytes.
    ///
    /// Fails with [`ReassemblyError::Overflow`] as soon as the decoded
    /// output would pass the bound.
    pub fn write(&mut self, data: &[u8]) -> Result<(), ReassemblyError> {
        if data.is_empty() {
            return Ok(());
        }

        if matches!(self.coding, Coding::Deflate) {
            let sink = BoundedBuffer::new(self.max_size);
            // zlib streams start with a CMF byte of 0x78 for the usual window size
            self.coding = if data[0] == 0x78 {
                Coding::Zlib(ZlibDecoder::new(sink))
            } else {
                Coding::RawDeflate(DeflateDecoder::new(sink))
            };
        }

        let result = match &mut self.coding {
            Coding::Identity(sink) => sink.write_all(data),
            Coding::Gzip(decoder) => decoder.write_all(data),
            Coding::Zlib(decoder) => decoder.write_all(data),
            Coding::RawDeflate(decoder) => decoder.write_all(data),
            Coding::Deflate => Ok(()),
        };
        result.map_err(|e| overflow_or_decode(e, self.max_size))
    }

    /// Flushes the decoder and returns the decoded body.
    pub fn finish(self) -> Result<Vec<u8>, ReassemblyError> {
        let max_size = self.max_size;
        let decoded = match self.coding {
            Coding::Identity(sink) => Ok(sink),
            Coding::Gzip(decoder) => decoder.finish(),
            Coding::Zlib(decoder) => decoder.finish(),
            Coding::RawDeflate(decoder) => decoder.finish(),
            Coding::Deflate => Ok(BoundedBuffer::new(max_size)),
        };
        match decoded {
            Ok(sink) => Ok(sink.buf),
            Err(e) => Err(overflow_or_decode(e, max_size)),
        }
    }

    /// Bytes decoded so far.
    pub fn decoded_len(&self) -> usize {
        match &self.coding {
            Coding::Identity(sink) => sink.buf.len(),
            Coding::Gzip(decoder) => decoder.get_ref().buf.len(),
            Coding::Zlib(decoder) => decoder.get_ref().buf.len(),
            Coding::RawDeflate(decoder) => decoder.get_ref().buf.len(),
            Coding::Deflate => 0,
        }
    }
}

fn overflow_or_decode(e: io::Error, max_size: usize) -> ReassemblyError {
    if e.get_ref().is_some_and(|inner| inner.is::<BufferFull>()) {
        ReassemblyError::Overflow { max: max_size }
    } else {
        ReassemblyError::Decode(e.to_string())
    }
}

/// Per-response capture state machine.
#[derive(Debug)]
pub struct Reassembler {
    state: ReassemblyState,
    max_buffer_size: usize,
    chunked: Option<ChunkedDecoder>,
    decoder: Option<ContentDecoder>,
    // Scratch space for de-chunked bytes before content decoding
    scratch: Vec<u8>,
    abandoned: Option<ReassemblyError>,
}

impl Reassembler {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            state: ReassemblyState::Idle,
            max_buffer_size,
            chunked: None,
            decoder: None,
            scratch: Vec::new(),
            abandoned: None,
        }
    }

    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    /// Why capture was abandoned, if it was.
    pub fn abandon_reason(&self) -> Option<&ReassemblyError> {
        self.abandoned.as_ref()
    }

    /// Response headers are known. `capture` is the selector's verdict.
    pub fn on_headers(
        &mut self,
        capture: bool,
        headers: &HashMap<String, String>,
        framing: TransferFraming,
    ) -> ReassemblyState {
        if self.state != ReassemblyState::Idle {
            return self.state;
        }
        if !capture {
            self.state = ReassemblyState::PassThrough;
            return self.state;
        }

        match ContentDecoder::for_encoding(
            header(headers, "content-encoding"),
            self.max_buffer_size,
        ) {
            Ok(decoder) => {
                self.decoder = Some(decoder);
                self.chunked = (framing == TransferFraming::Chunked).then(ChunkedDecoder::new);
                self.state = ReassemblyState::Buffering;
            }
            Err(e) => self.abandon(e),
        }
        self.state
    }

    /// A body chunk passed through the proxy.
    pub fn on_chunk(&mut self, chunk: &[u8]) -> ReassemblyState {
        if self.state == ReassemblyState::Buffering {
            if let Err(e) = self.feed(chunk) {
                self.abandon(e);
            }
        }
        self.state
    }

    /// The body has ended. Returns the decoded body if capture completed.
    pub fn on_end(&mut self) -> Option<Vec<u8>> {
        match self.state {
            ReassemblyState::Buffering => match self.finish() {
                Ok(body) => {
                    self.state = ReassemblyState::Complete;
                    Some(body)
                }
                Err(e) => {
                    self.abandon(e);
                    self.state = ReassemblyState::Done;
                    None
                }
            },
            ReassemblyState::PassThrough | ReassemblyState::Idle => {
                self.state = ReassemblyState::Done;
                None
            }
            ReassemblyState::Complete | ReassemblyState::Done => None,
        }
    }

    /// The upstream body failed; capture is dropped.
    pub fn abort(&mut self) {
        if self.state == ReassemblyState::Buffering {
            self.release();
            self.state = ReassemblyState::PassThrough;
        }
    }

    fn feed(&mut self, chunk: &[u8]) -> Result<(), ReassemblyError> {
        let decoder = self.decoder.as_mut().ok_or(ReassemblyError::Truncated)?;
        match self.chunked.as_mut() {
            Some(chunked) => {
                self.scratch.clear();
                chunked.decode(chunk, &mut self.scratch)?;
                decoder.write(&self.scratch)
            }
            None => decoder.write(chunk),
        }
    }

    fn finish(&mut self) -> Result<Vec<u8>, ReassemblyError> {
        if let Some(chunked) = self.chunked.take() {
            if !chunked.is_done() {
                return Err(ReassemblyError::Truncated);
            }
        }
        let decoder = self.decoder.take().ok_or(ReassemblyError::Truncated)?;
        decoder.finish()
    }

    fn abandon(&mut self, reason: ReassemblyError) {
        tracing::warn!("Abandoning capture: {}", reason);
        self.release();
        self.abandoned = Some(reason);
        self.state = ReassemblyState::PassThrough;
    }

    fn release(&mut self) {
        self.chunked = None;
        self.decoder = None;
        self.scratch = Vec::new();
    }
}
