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

/// Byte terminating every frame on the wire.
pub const FRAME_TERMINATOR: u8 = 0x00;

/// Dispatch key of the extension (`%xt%`) frame family.
pub const XT_DISPATCH_KEY: char = '%';

/// Dispatch key of the XML system frame family.
pub const SYS_DISPATCH_KEY: char = '<';

/// Marker field that follows the leading delimiter of an extension frame.
pub const XT_MARKER: &str = "xt";

/// Index of the action key in an extension frame's argument vector.
///
/// The vector is the raw frame followed by its `%`-separated fields, so for
/// `%xt%foo%3%` it reads `["%xt%foo%3%", "", "xt", "foo", "3", ""]`.
pub const XT_ACTION_INDEX: usize = 3;

/// Index of the room identifier in an extension frame's argument vector.
pub const XT_ROOM_INDEX: usize = 4;

/// Default upper bound for a single unterminated inbound frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8192;
