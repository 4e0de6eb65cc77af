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

/// Result Type for Codec Operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while framing or parsing protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// An I/O error occurred on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An inbound frame grew past the configured limit without a terminator.
    #[error("frame of {length} bytes exceeds the {max} byte limit")]
    FrameTooLong {
        /// Bytes buffered so far
        length: usize,
        /// Configured maximum
        max: usize,
    },

    /// The frame was empty where content was required.
    #[error("empty frame")]
    EmptyFrame,

    /// The frame does not start with a known dispatch key.
    #[error("unknown dispatch key {0:?}")]
    UnknownDispatchKey(char),

    /// An extension frame did not have the `%xt%<action>%` shape.
    #[error("malformed extension frame: {reason}")]
    MalformedXt {
        /// What was wrong with the frame
        reason: &'static str,
    },

    /// A system frame was not well-formed XML.
    #[error("malformed system frame: {0}")]
    Xml(String),

    /// A system frame had no `<msg>` root or no `<body>` element.
    #[error("system frame is missing the <{0}> element")]
    MissingElement(&'static str),

    /// A system frame's `<body>` carried no `action` attribute.
    #[error("system frame has no action attribute")]
    MissingAction,
}

impl CodecError {
    /// Whether this error is fatal for the stream it was raised on.
    ///
    /// Parse errors only affect one frame; I/O and framing errors poison the stream.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(self, CodecError::Io(_) | CodecError::FrameTooLong { .. })
    }
}

impl From<quick_xml::Error> for CodecError {
    fn from(err: quick_xml::Error) -> Self {
        CodecError::Xml(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for CodecError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        CodecError::Xml(err.to_string())
    }
}
