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

//! Emberlink Session Core
//!
//! This crate accepts client sockets, frames the Emberlink text protocol,
//! routes every inbound frame to a registered action handler and
//! coordinates world saves and crash recovery while connections stay live.
//!
//! # Architecture
//!
//! ```text
//! Listener --(accepted sockets)--> MessagePump --> NetState --(frames)--> NetStateHandler
//!                                                                            |
//!                                                                      PacketHandler
//!
//! ServerWorker (tick thread): TimerService -> MessagePump::slice -> NetStateHandler::process_disposed_queue
//! ServerHandler: run state, wake signal, crash pipeline
//! World: load/save around NetStateHandler::pause/resume
//! EventSink: every cross-component notification
//! ```
//!
//! Socket I/O runs on the tokio runtime. All structural changes to the live
//! connection list happen on the single tick thread.
//!
//! # Example
//!
//! ```no_run
//! use emberlink_service::{GameServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = GameServer::new(ServerConfig::default())?;
//!     server.events().world_save.subscribe(|_| {
//!         // Snapshot game state
//!     });
//!     server.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown();
//!     Ok(())
//! }
//! ```

mod config;
mod crash;
mod error;
mod event;
mod listener;
mod message_pump;
mod metrics;
mod net_state;
mod net_state_handler;
mod packet_handler;
mod process;
mod server;
mod server_handler;
mod sync;
mod timer;
mod types;
mod worker;
mod world;

pub use config::{CrashGuardConfig, DEFAULT_PORT, DEFAULT_SEND_QUEUE_SIZE, ServerConfig};
pub use crash::{BackupService, CrashGuard, DirectoryBackup, WRITE_COMPLETION_TIMEOUT, crash_report};
pub use error::{BindFailure, NetError, Result};
pub use event::{
    CrashedEventArgs, Event, EventSink, NetStateAddedEventArgs, NetStateRemovedEventArgs,
    ServerClosingEventArgs, ServerStartedEventArgs, ShutdownEventArgs, SocketConnectEventArgs,
    Subscriber, WorldBroadcastEventArgs, WorldLoadEventArgs, WorldSaveEventArgs,
};
pub use listener::{Listener, classify_bind_error};
pub use message_pump::MessagePump;
pub use metrics::{Counter, MetricsSnapshot, ServerMetrics};
pub use net_state::{BoxedTransport, NetState, SessionData, ThrottlePredicate, Transport};
pub use net_state_handler::{DISPOSAL_BATCH, NetStateHandler, ProtocolHandler};
pub use packet_handler::{
    PacketHandler, ProtocolModule, SysFactory, SysHandler, XtFactory, XtHandler,
};
pub use process::{ProcessControl, SystemProcess};
pub use server::{GameServer, GameServerBuilder};
pub use server_handler::{PanicDetails, RunState, RunStateSnapshot, ServerHandler};
pub use sync::{Signal, WriteBarrier};
pub use timer::{TimerHandle, TimerService};
pub use types::{AsyncState, ConnectionId, ConnectionInfo, ServerSnapshot};
pub use worker::{ServerWorker, TICK_THREAD_NAME};
pub use world::{ConfigPersistence, NoPersistence, SAVE_ANNOUNCEMENT, World};
