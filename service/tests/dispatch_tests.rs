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

//! Protocol dispatch tests

use emberlink_codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec, SysFrame};
use emberlink_service::{
    EventSink, NetState, NetStateHandler, PacketHandler, ProtocolModule, ServerConfig,
    ServerMetrics, ServerStartedEventArgs, SysFactory, SysHandler, XtFactory, XtHandler,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing_test::traced_test;

struct Ping(Arc<NetState>);

impl XtHandler for Ping {
    fn handle(&mut self, args: &[String]) {
        let room = args.get(4).map(String::as_str).unwrap_or("-1");
        self.0.send(format!("%xt%pong%{}%", room));
    }
}

struct VersionCheck(Arc<NetState>);

impl SysHandler for VersionCheck {
    fn handle(&mut self, frame: &SysFrame) {
        let reply = if frame.action() == "verChk" { "apiOK" } else { "apiKO" };
        self.0.send(format!(
            "<msg t='sys'><body action='{}' r='0'></body></msg>",
            reply
        ));
    }
}

struct Lobby;

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
        vec![(
            "verChk",
            Arc::new(|net_state: Arc<NetState>| {
                Box::new(VersionCheck(net_state)) as Box<dyn SysHandler>
            }),
        )]
    }
}

fn setup() -> (Arc<NetStateHandler>, Arc<PacketHandler>) {
    let events = Arc::new(EventSink::new());
    let metrics = Arc::new(ServerMetrics::new());
    let registry =
        NetStateHandler::new(events.clone(), ServerConfig::default(), metrics.clone());
    let packets = PacketHandler::new(metrics);
    packets.add_module(Arc::new(Lobby));
    packets.install(&events, &registry);
    events.server_started.publish(&ServerStartedEventArgs);
    (registry, packets)
}

#[tokio::test]
async fn test_xt_round_trip_over_transport() {
    let (registry, _packets) = setup();
    let (client, server) = tokio::io::duplex(4096);
    let net_state = registry.register(Box::new(server), "127.0.0.1:4000".parse().unwrap());
    net_state.start();

    let (read, mut write) = tokio::io::split(client);
    let mut reader = FramedRead::new(read, FrameCodec::new(DEFAULT_MAX_FRAME_LENGTH));

    write.write_all(b"%xt%ping%7%\0").await.unwrap();
    let reply = timeout(Duration::from_secs(2), reader.next()).await.unwrap();
    assert_eq!(reply.unwrap().unwrap(), "%xt%pong%7%");

    write
        .write_all(b"<msg t='sys'><body action='verChk' r='0'><ver v='153'/></body></msg>\0")
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(2), reader.next()).await.unwrap();
    assert_eq!(
        reply.unwrap().unwrap(),
        "<msg t='sys'><body action='apiOK' r='0'></body></msg>"
    );
}

#[tokio::test]
#[traced_test]
async fn test_unknown_dispatch_key_logs_and_keeps_connection() {
    let (registry, _packets) = setup();
    let (_client, server) = tokio::io::duplex(64);
    let net_state = registry.register(Box::new(server), "127.0.0.1:4001".parse().unwrap());

    registry.dispatch(&net_state, "#garbage");

    assert!(logs_contain("Protocol error: unknown dispatch key"));
    assert!(logs_contain("#garbage"));
    assert_eq!(registry.metrics().snapshot().protocol_errors, 1);
    assert!(!net_state.is_disposing());
}

#[tokio::test]
#[traced_test]
async fn test_unknown_action_logs_and_keeps_connection() {
    let (registry, _packets) = setup();
    let (_client, server) = tokio::io::duplex(64);
    let net_state = registry.register(Box::new(server), "127.0.0.1:4002".parse().unwrap());

    registry.dispatch(&net_state, "%xt%teleport%1%");
    registry.dispatch(&net_state, "<msg t='sys'><body action='logout' r='0'/></msg>");

    assert!(logs_contain("Protocol error: unknown action"));
    assert!(logs_contain("teleport"));
    assert!(logs_contain("logout"));
    assert_eq!(registry.metrics().snapshot().protocol_errors, 2);
    assert!(!net_state.is_disposing());
}

#[tokio::test]
#[traced_test]
async fn test_malformed_frame_is_protocol_error() {
    let (registry, _packets) = setup();
    let (_client, server) = tokio::io::duplex(64);
    let net_state = registry.register(Box::new(server), "127.0.0.1:4003".parse().unwrap());

    registry.dispatch(&net_state, "%yt%ping%");

    assert!(logs_contain("Protocol error"));
    assert_eq!(registry.metrics().snapshot().protocol_errors, 1);
    assert!(!net_state.is_disposing());
}

#[test]
fn test_first_registration_wins() {
    struct Shadow;

    impl ProtocolModule for Shadow {
        fn name(&self) -> &str {
            "shadow"
        }

        fn xt_handlers(&self) -> Vec<(&'static str, XtFactory)> {
            vec![(
                "ping",
                Arc::new(|_: Arc<NetState>| -> Box<dyn XtHandler> {
                    panic!("shadowed handler must not run")
                }),
            )]
        }
    }

    let events = Arc::new(EventSink::new());
    let metrics = Arc::new(ServerMetrics::new());
    let registry =
        NetStateHandler::new(events.clone(), ServerConfig::default(), metrics.clone());
    let packets = PacketHandler::new(metrics);
    packets.add_module(Arc::new(Lobby));
    packets.add_module(Arc::new(Shadow));
    packets.install(&events, &registry);
    events.server_started.publish(&ServerStartedEventArgs);

    assert_eq!(packets.xt_count(), 1);
    let (_client, server) = tokio::io::duplex(64);
    let net_state = registry.register(Box::new(server), "127.0.0.1:4004".parse().unwrap());
    registry.dispatch(&net_state, "%xt%ping%1%");
}
