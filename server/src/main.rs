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

//! Emberlink Server
//!
//! Host process for the session core: reads the configuration file,
//! installs logging, registers the protocol modules and runs until a
//! termination signal arrives.

mod config;
mod lobby;
mod logging;
mod signals;

use crate::config::{AppConfig, TomlPersistence};
use crate::lobby::Lobby;
use clap::Parser;
use emberlink_service::GameServer;
use std::path::PathBuf;
use std::sync::Arc;

/// Command line options; each one overrides the configuration file
#[derive(Debug, Parser)]
#[command(name = "emberlink-server", version, about = "Emberlink game server")]
struct Cli {
    /// Configuration file, created with defaults if missing
    #[arg(short, long, value_name = "FILE", default_value = "emberlink.toml")]
    config: PathBuf,

    /// Listen address; repeat for several endpoints
    #[arg(short, long = "bind", value_name = "ADDRESS")]
    bind: Vec<String>,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if !self.bind.is_empty() {
            config.server.listeners = self.bind.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json_format = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut app = AppConfig::load_from_file(&cli.config).await?;
    cli.apply(&mut app);
    logging::init(&app.logging)?;

    let server = GameServer::builder(app.to_server_config()?)
        .with_persistence(Arc::new(TomlPersistence::new(cli.config.clone(), app.clone())))
        .with_module(Arc::new(Lobby))
        .with_panic_hook(true)
        .build()?;

    let addresses = server.start().await?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listeners = ?addresses,
        "Emberlink server running"
    );

    signals::shutdown_requested().await?;

    server.shutdown();
    let handler = server.server_handler().clone();
    tokio::task::spawn_blocking(move || handler.kill_server(false)).await?;
    Ok(())
}
