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

//! Frame families of the protocol

use crate::consts::{SYS_DISPATCH_KEY, XT_ACTION_INDEX, XT_DISPATCH_KEY, XT_MARKER, XT_ROOM_INDEX};
use crate::result::{CodecError, CodecResult};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::borrow::Cow;

/// Return the dispatch key (first character) of a decoded frame.
pub fn dispatch_key(frame: &str) -> Option<char> {
    frame.chars().next()
}

/// A parsed frame of either family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `%xt%` extension frame
    Xt(XtFrame),
    /// XML system frame
    Sys(SysFrame),
}

impl Frame {
    /// Parse a decoded frame, selecting the family by its dispatch key.
    pub fn parse(raw: &str) -> CodecResult<Frame> {
        match dispatch_key(raw) {
            Some(XT_DISPATCH_KEY) => XtFrame::parse(raw).map(Frame::Xt),
            Some(SYS_DISPATCH_KEY) => SysFrame::parse(raw).map(Frame::Sys),
            Some(other) => Err(CodecError::UnknownDispatchKey(other)),
            None => Err(CodecError::EmptyFrame),
        }
    }

    /// The action key of the frame.
    pub fn action(&self) -> &str {
        match self {
            Frame::Xt(xt) => xt.action(),
            Frame::Sys(sys) => sys.action(),
        }
    }
}

/// A `%`-delimited extension frame.
///
/// The argument vector holds the raw frame at index 0 followed by every `%`-separated field, so
/// the action key sits at [`XT_ACTION_INDEX`] and the room at [`XT_ROOM_INDEX`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XtFrame {
    args: Vec<String>,
}

impl XtFrame {
    /// Split and validate an extension frame.
    pub fn parse(raw: &str) -> CodecResult<XtFrame> {
        if !raw.starts_with(XT_DISPATCH_KEY) {
            return Err(CodecError::MalformedXt {
                reason: "frame does not start with '%'",
            });
        }

        let mut args = Vec::with_capacity(8);
        args.push(raw.to_string());
        args.extend(raw.split(XT_DISPATCH_KEY).map(str::to_string));

        if args.len() <= XT_ACTION_INDEX {
            return Err(CodecError::MalformedXt {
                reason: "frame has no action field",
            });
        }
        if args[XT_ACTION_INDEX - 1] != XT_MARKER {
            return Err(CodecError::MalformedXt {
                reason: "frame is missing the xt marker",
            });
        }
        if args[XT_ACTION_INDEX].is_empty() {
            return Err(CodecError::MalformedXt {
                reason: "action field is empty",
            });
        }

        Ok(XtFrame { args })
    }

    /// The raw frame text.
    pub fn raw(&self) -> &str {
        &self.args[0]
    }

    /// The action key.
    pub fn action(&self) -> &str {
        &self.args[XT_ACTION_INDEX]
    }

    /// The room or level identifier, when present.
    pub fn room(&self) -> Option<&str> {
        self.arg(XT_ROOM_INDEX).filter(|room| !room.is_empty())
    }

    /// A single argument by index.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// The full argument vector.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Fields following the room identifier, without the trailing empty field.
    pub fn params(&self) -> &[String] {
        let start = (XT_ROOM_INDEX + 1).min(self.args.len());
        let mut end = self.args.len();
        if end > start && self.args[end - 1].is_empty() {
            end -= 1;
        }
        &self.args[start..end]
    }
}

/// An XML system frame.
///
/// Only the envelope is interpreted on parse: the `t` attribute of `<msg>` and the `action` and `r`
/// attributes of the first `<body>`. Handlers read the payload with [`SysFrame::child_attribute`]
/// and [`SysFrame::child_text`], or from [`SysFrame::raw`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysFrame {
    raw: String,
    message_type: Option<String>,
    action: String,
    room: Option<String>,
}

impl SysFrame {
    /// Parse the envelope of a system frame.
    pub fn parse(raw: &str) -> CodecResult<SysFrame> {
        let mut reader = Reader::from_str(raw);
        reader.config_mut().trim_text(true);

        let mut depth = 0usize;
        let mut saw_root = false;
        let mut message_type = None;

        loop {
            match reader.read_event()? {
                Event::Start(element) => {
                    if let Some(frame) =
                        Self::visit(raw, &element, depth, &mut saw_root, &mut message_type)?
                    {
                        return Ok(frame);
                    }
                    depth += 1;
                }
                Event::Empty(element) => {
                    if let Some(frame) =
                        Self::visit(raw, &element, depth, &mut saw_root, &mut message_type)?
                    {
                        return Ok(frame);
                    }
                }
                Event::End(_) => depth = depth.saturating_sub(1),
                Event::Eof => break,
                _ => {}
            }
        }

        if saw_root {
            Err(CodecError::MissingElement("body"))
        } else {
            Err(CodecError::MissingElement("msg"))
        }
    }

    fn visit(
        raw: &str,
        element: &BytesStart<'_>,
        depth: usize,
        saw_root: &mut bool,
        message_type: &mut Option<String>,
    ) -> CodecResult<Option<SysFrame>> {
        match (depth, element.name().as_ref()) {
            (0, b"msg") => {
                *saw_root = true;
                *message_type = attribute(element, b"t")?;
                Ok(None)
            }
            (0, _) => Err(CodecError::MissingElement("msg")),
            (1, b"body") => {
                let action = attribute(element, b"action")?
                    .filter(|action| !action.is_empty())
                    .ok_or(CodecError::MissingAction)?;
                let room = attribute(element, b"r")?;
                Ok(Some(SysFrame {
                    raw: raw.to_string(),
                    message_type: message_type.take(),
                    action,
                    room,
                }))
            }
            _ => Ok(None),
        }
    }

    /// The raw frame text.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The `t` attribute of the `<msg>` element (usually `sys`).
    pub fn message_type(&self) -> Option<&str> {
        self.message_type.as_deref()
    }

    /// The action key.
    pub fn action(&self) -> &str {
        &self.action
    }

    /// The `r` attribute of the `<body>` element.
    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    /// Attribute `name` of the first `<element>` in the frame.
    pub fn child_attribute(&self, element: &str, name: &str) -> CodecResult<Option<String>> {
        let mut reader = Reader::from_str(&self.raw);
        loop {
            match reader.read_event()? {
                Event::Start(start) | Event::Empty(start) if is_named(&start, element) => {
                    return attribute(&start, name.as_bytes());
                }
                Event::Eof => return Ok(None),
                _ => {}
            }
        }
    }

    /// Text and CDATA content of the first `<element>` in the frame, trimmed.
    pub fn child_text(&self, element: &str) -> CodecResult<Option<String>> {
        let mut reader = Reader::from_str(&self.raw);
        let mut text: Option<String> = None;
        loop {
            match reader.read_event()? {
                Event::Start(start) if text.is_none() && is_named(&start, element) => {
                    text = Some(String::new());
                }
                Event::Empty(start) if text.is_none() && is_named(&start, element) => {
                    return Ok(Some(String::new()));
                }
                Event::Text(content) => {
                    if let Some(text) = text.as_mut() {
                        text.push_str(&content.unescape()?);
                    }
                }
                Event::CData(content) => {
                    if let Some(text) = text.as_mut() {
                        text.push_str(&String::from_utf8_lossy(&content.into_inner()));
                    }
                }
                Event::End(end) if text.is_some() && end.name().as_ref() == element.as_bytes() => {
                    return Ok(text.map(|text| text.trim().to_string()));
                }
                Event::Eof => return Ok(None),
                _ => {}
            }
        }
    }
}

fn is_named(element: &BytesStart<'_>, name: &str) -> bool {
    element.name().as_ref() == name.as_bytes()
}

/// Escape `text` for use in XML content or a quoted attribute.
pub fn escape_xml(text: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(text)
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> CodecResult<Option<String>> {
    for attr in element.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == name {
            let value = attr
                .unescape_value()
                .map_err(|err| CodecError::Xml(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xt_args_layout() {
        let frame = XtFrame::parse("%xt%foo%3%bar%").unwrap();
        assert_eq!(frame.args()[0], "%xt%foo%3%bar%");
        assert_eq!(frame.args()[XT_ACTION_INDEX], "foo");
        assert_eq!(frame.action(), "foo");
        assert_eq!(frame.room(), Some("3"));
        assert_eq!(frame.params(), &["bar".to_string()]);
    }

    #[test]
    fn test_xt_without_room() {
        let frame = XtFrame::parse("%xt%ping%").unwrap();
        assert_eq!(frame.action(), "ping");
        assert_eq!(frame.room(), None);
        assert!(frame.params().is_empty());
    }

    #[test]
    fn test_xt_malformed() {
        assert!(XtFrame::parse("%yt%foo%1%").is_err());
        assert!(XtFrame::parse("%xt").is_err());
        assert!(XtFrame::parse("%xt%%1%").is_err());
        assert!(XtFrame::parse("xt%foo%").is_err());
    }

    #[test]
    fn test_sys_envelope() {
        let frame = SysFrame::parse(
            "<msg t=\"sys\"><body action='verChk' r='0'><ver v='153' /></body></msg>",
        )
        .unwrap();
        assert_eq!(frame.message_type(), Some("sys"));
        assert_eq!(frame.action(), "verChk");
        assert_eq!(frame.room(), Some("0"));
    }

    #[test]
    fn test_sys_empty_body() {
        let frame = SysFrame::parse("<msg t='sys'><body action='logout' r='-1'/></msg>").unwrap();
        assert_eq!(frame.action(), "logout");
        assert_eq!(frame.room(), Some("-1"));
    }

    #[test]
    fn test_sys_errors() {
        assert!(matches!(
            SysFrame::parse("<msg t='sys'><body r='0'/></msg>"),
            Err(CodecError::MissingAction)
        ));
        assert!(matches!(
            SysFrame::parse("<msg t='sys'></msg>"),
            Err(CodecError::MissingElement("body"))
        ));
        assert!(matches!(
            SysFrame::parse("<cross-domain-request/>"),
            Err(CodecError::MissingElement("msg"))
        ));
    }

    #[test]
    fn test_sys_payload_lookups() {
        let frame = SysFrame::parse(
            "<msg t='sys'><body action='login' r='0'><login z=\"lobby\"><nick><![CDATA[ ember ]]></nick>\
             <pword>a&amp;b</pword><ver v=\"153\"/></login></body></msg>",
        )
        .unwrap();
        assert_eq!(frame.child_attribute("login", "z").unwrap().as_deref(), Some("lobby"));
        assert_eq!(frame.child_attribute("ver", "v").unwrap().as_deref(), Some("153"));
        assert_eq!(frame.child_attribute("ver", "x").unwrap(), None);
        assert_eq!(frame.child_attribute("missing", "v").unwrap(), None);
        assert_eq!(frame.child_text("nick").unwrap().as_deref(), Some("ember"));
        assert_eq!(frame.child_text("pword").unwrap().as_deref(), Some("a&b"));
        assert_eq!(frame.child_text("ver").unwrap().as_deref(), Some(""));
        assert_eq!(frame.child_text("missing").unwrap(), None);
    }

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("plain"), "plain");
        assert_eq!(escape_xml("a'b<c>&"), "a&apos;b&lt;c&gt;&amp;");
    }

    #[test]
    fn test_frame_dispatch() {
        assert!(matches!(Frame::parse("%xt%a%1%"), Ok(Frame::Xt(_))));
        assert!(matches!(
            Frame::parse("<msg t='sys'><body action='a'/></msg>"),
            Ok(Frame::Sys(_))
        ));
        assert!(matches!(Frame::parse("hello"), Err(CodecError::UnknownDispatchKey('h'))));
        assert!(matches!(Frame::parse(""), Err(CodecError::EmptyFrame)));
    }
}
