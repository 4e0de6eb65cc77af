//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use crate::consts::{DEFAULT_MAX_FRAME_LENGTH, FRAME_TERMINATOR};
use crate::result::CodecError;
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// NUL-terminated text frame codec.
///
/// Decoding splits the inbound byte stream on [`FRAME_TERMINATOR`] and yields each frame as a
/// `String` (invalid UTF-8 is replaced, empty frames are skipped). Encoding writes the message
/// followed by exactly one terminator byte.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_length: usize,
    /// Offset already scanned for a terminator, so partial frames are not rescanned.
    next_index: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl FrameCodec {
    /// Create a codec that rejects unterminated frames longer than `max_length` bytes.
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }

    /// Maximum length of a single inbound frame.
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            let scan_from = self.next_index.min(src.len());
            match src[scan_from..].iter().position(|b| *b == FRAME_TERMINATOR) {
                Some(offset) => {
                    let end = scan_from + offset;
                    self.next_index = 0;
                    let frame = src.split_to(end + 1);
                    if end == 0 {
                        continue;
                    }
                    let text = String::from_utf8_lossy(&frame[..end]).into_owned();
                    trace!(length = end, "Decoded frame");
                    return Ok(Some(text));
                }
                None => {
                    if src.len() > self.max_length {
                        let length = src.len();
                        src.clear();
                        self.next_index = 0;
                        return Err(CodecError::FrameTooLong {
                            length,
                            max: self.max_length,
                        });
                    }
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !buf.is_empty() {
                    trace!(length = buf.len(), "Discarding unterminated trailing bytes");
                    buf.clear();
                    self.next_index = 0;
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<&str> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(FRAME_TERMINATOR);
        Ok(())
    }
}

impl Encoder<String> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode(item.as_str(), dst)
    }
}
