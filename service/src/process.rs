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

//! Process exit and re-exec

use std::io::BufRead;
use std::process::Command;

/// How the server leaves the process
pub trait ProcessControl: Send + Sync {
    /// Start a fresh copy of the process, then exit this one
    fn restart(&self);

    /// Exit with `code`
    fn terminate(&self, code: i32);

    /// Block until an operator acknowledges a fatal error
    fn await_acknowledgement(&self);
}

/// The real process
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcess;

impl ProcessControl for SystemProcess {
    fn restart(&self) {
        match std::env::current_exe() {
            Ok(exe) => {
                let args: Vec<_> = std::env::args_os().skip(1).collect();
                match Command::new(&exe).args(&args).spawn() {
                    Ok(child) => {
                        tracing::info!(pid = child.id(), exe = %exe.display(), "Restarted")
                    }
                    Err(err) => {
                        tracing::error!(exe = %exe.display(), error = %err, "Restart failed")
                    }
                }
            }
            Err(err) => tracing::error!(error = %err, "Unable to locate executable for restart"),
        }
        std::process::exit(0);
    }

    fn terminate(&self, code: i32) {
        std::process::exit(code);
    }

    fn await_acknowledgement(&self) {
        tracing::error!("This exception is fatal, press return to exit");
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
    }
}
