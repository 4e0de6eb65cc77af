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

//! # Emberlink Frame Codec
//!
//! This crate implements the transport framing of the Emberlink text protocol and the parsing of
//! its two frame families. It is designed to sit under a `tokio_util::codec::Framed` stream and
//! knows nothing about sockets, connections or handlers.
//!
//! ## Wire Format
//!
//! Every message travels as UTF-8 text terminated by a single NUL byte (`0x00`). The first
//! character of a frame is its *dispatch key* and selects the frame family:
//!
//! | Key | Family | Shape |
//! |-----|--------|-------|
//! | `%` | Extension ([`XtFrame`]) | `%xt%<action>%<room>%<field>%...%` |
//! | `<` | System ([`SysFrame`]) | `<msg t="sys"><body action='<action>' r='<room>'>...</body></msg>` |
//!
//! ## Usage Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use emberlink_codec::{Frame, FrameCodec};
//! use tokio_util::codec::{Decoder, Encoder};
//!
//! let mut codec = FrameCodec::new(8192);
//! let mut input = BytesMut::from(&b"%xt%ping%1%\0<msg t='sys'><body action='verChk' r='0'/></msg>\0"[..]);
//!
//! while let Some(text) = codec.decode(&mut input).unwrap() {
//!     match Frame::parse(&text).unwrap() {
//!         Frame::Xt(xt) => assert_eq!(xt.action(), "ping"),
//!         Frame::Sys(sys) => assert_eq!(sys.action(), "verChk"),
//!     }
//! }
//!
//! let mut output = BytesMut::new();
//! codec.encode("%xt%pong%1%", &mut output).unwrap();
//! assert_eq!(&output[..], b"%xt%pong%1%\0");
//! ```

mod codec;
mod consts;
mod frame;
mod result;

pub use codec::FrameCodec;
pub use consts::{
    DEFAULT_MAX_FRAME_LENGTH, FRAME_TERMINATOR, SYS_DISPATCH_KEY, XT_ACTION_INDEX,
    XT_DISPATCH_KEY, XT_MARKER, XT_ROOM_INDEX,
};
pub use frame::{Frame, SysFrame, XtFrame, dispatch_key, escape_xml};
pub use result::{CodecError, CodecResult};
