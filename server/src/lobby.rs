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

//! Sample protocol module
//!
//! Answers the version handshake, records a login name on the connection
//! and replies to `ping`. It exists to show how actions are registered.

use emberlink_codec::{SysFrame, escape_xml};
use emberlink_service::{
    NetState, ProtocolModule, SessionData, SysFactory, SysHandler, XtFactory, XtHandler,
};
use std::sync::Arc;

/// Account bound to a connection after login
#[derive(Debug)]
pub struct Account {
    name: String,
}

impl Account {
    /// Login name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SessionData for Account {
    fn on_removed(&self, net_state: &NetState) {
        tracing::debug!(connection_id = %net_state.id(), account = %self.name, "Logged out");
    }

    fn account_name(&self) -> Option<String> {
        Some(self.name.clone())
    }
}

fn sys_reply(action: &str, room: &str, body: &str) -> String {
    format!("<msg t='sys'><body action='{}' r='{}'>{}</body></msg>", action, room, body)
}

struct VersionCheck(Arc<NetState>);

impl SysHandler for VersionCheck {
    fn handle(&mut self, frame: &SysFrame) {
        let room = frame.room().unwrap_or("0");
        let action = match frame.child_attribute("ver", "v") {
            Ok(Some(version)) if !version.is_empty() => "apiOK",
            _ => "apiKO",
        };
        self.0.send(sys_reply(action, room, ""));
    }
}

struct Login(Arc<NetState>);

impl SysHandler for Login {
    fn handle(&mut self, frame: &SysFrame) {
        let room = frame.room().unwrap_or("0");
        let name = frame.child_text("nick").ok().flatten().unwrap_or_default();
        if name.is_empty() {
            self.0.send(sys_reply("logKO", room, "<login e='Missing name'/>"));
            return;
        }
        match self.0.set(Account { name }) {
            Ok(account) => {
                tracing::info!(connection_id = %self.0.id(), account = account.name(), "Logged in");
                let body = format!("<login n='{}'/>", escape_xml(account.name()));
                self.0.send(sys_reply("logOK", room, &body));
            }
            Err(_) => self
                .0
                .send(sys_reply("logKO", room, "<login e='Already logged in'/>")),
        }
    }
}

struct Ping(Arc<NetState>);

impl XtHandler for Ping {
    fn handle(&mut self, args: &[String]) {
        let room = args.get(4).map(String::as_str).unwrap_or("-1");
        self.0.send(format!("%xt%pong%{}%", room));
    }
}

/// Handshake, login and ping
#[derive(Debug, Default)]
pub struct Lobby;

impl ProtocolModule for Lobby {
    fn name(&self) -> &str {
        "lobby"
    }

    fn xt_handlers(&self) -> Vec<(&'static str, XtFactory)> {
        vec![(
            "ping",
            Arc::new(|net_state: Arc<NetState>| Box::new(Ping(net_state)) as Box<dyn XtHandler>),
        )]
    }

    fn sys_handlers(&self) -> Vec<(&'static str, SysFactory)> {
        vec![
            (
                "verChk",
                Arc::new(|net_state: Arc<NetState>| {
                    Box::new(VersionCheck(net_state)) as Box<dyn SysHandler>
                }),
            ),
            (
                "login",
                Arc::new(|net_state: Arc<NetState>| {
                    Box::new(Login(net_state)) as Box<dyn SysHandler>
                }),
            ),
        ]
    }
}
