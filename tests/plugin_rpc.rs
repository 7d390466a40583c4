//! Supervisor ↔ plugin transport integration tests over real loopback
//! sockets: registration, stored-config push, send/receive, status probe,
//! events in both directions, reconnect, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use homelink::channel::echo::EchoChannel;
use homelink::channel::transport::PluginTransport;
use homelink::channel::{ChannelContext, ChannelPlugin};
use homelink::config::{self, ChannelConfig, Config};
use homelink::message::{ChannelInfo, UnifiedMessage};
use homelink::router::{allow_all, MessageRouter};
use homelink::supervisor::{ChannelEvent, PluginSupervisor};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// ── Harness ─────────────────────────────────────────────────────────────────

struct Hub {
    supervisor: Arc<PluginSupervisor>,
    router: Arc<MessageRouter>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<Result<()>>,
    url: String,
}

async fn start_hub(config: &Config, listener: TcpListener) -> Hub {
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (event_tx, events) = mpsc::unbounded_channel();
    let router = Arc::new(MessageRouter::new(allow_all()));
    let supervisor = Arc::new(PluginSupervisor::new(config, router.clone(), event_tx));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(supervisor.clone().run(listener, cancel.clone()));
    Hub {
        supervisor,
        router,
        events,
        cancel,
        task,
        url,
    }
}

async fn wait_for_channel(supervisor: &PluginSupervisor, name: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
    loop {
        if supervisor
            .connected_channels()
            .await
            .iter()
            .any(|c| c == name)
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "channel '{name}' never registered"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ── Recording test plugin ───────────────────────────────────────────────────

#[derive(Debug)]
enum Call {
    Configured(Value),
    Started,
    Stopped,
    Sent(UnifiedMessage),
    Event(String, Value),
}

struct TestPlugin {
    calls: mpsc::UnboundedSender<Call>,
    ctx: Option<ChannelContext>,
}

#[async_trait::async_trait]
impl ChannelPlugin for TestPlugin {
    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: "probe".to_string(),
            version: "0.0.1".to_string(),
            description: "recording test plugin".to_string(),
        }
    }

    fn attach(&mut self, ctx: ChannelContext) {
        self.ctx = Some(ctx);
    }

    async fn on_configure(&mut self, config: Value) -> Result<()> {
        let _ = self.calls.send(Call::Configured(config));
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let _ = self.calls.send(Call::Started);
        Ok(())
    }

    async fn on_stop(&mut self) {
        let _ = self.calls.send(Call::Stopped);
    }

    async fn send(&mut self, message: UnifiedMessage) -> Result<()> {
        let _ = self.calls.send(Call::Sent(message));
        Ok(())
    }

    async fn on_event(&mut self, event: &str, data: Value) {
        if let Some(ctx) = &self.ctx {
            match event {
                // Bounce an event back to the hub.
                "reflect" => ctx.emit_event("reflected", data.clone()),
                // Emit an inbound message on command.
                "emit_message" => {
                    let body = data.get("body").and_then(Value::as_str).unwrap_or("hi");
                    ctx.emit(&UnifiedMessage::inbound_text("probe", "remote-1", body));
                }
                _ => {}
            }
        }
        let _ = self.calls.send(Call::Event(event.to_string(), data));
    }
}

async fn expect_call<F>(rx: &mut mpsc::UnboundedReceiver<Call>, what: &str, pred: F) -> Call
where
    F: Fn(&Call) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let call = rx.recv().await.expect("plugin call channel closed");
            if pred(&call) {
                return call;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn register_configure_send_probe_event_stop() {
    let dir = tempfile::tempdir().unwrap();
    let hub_config = Config::load(Some(dir.path().to_path_buf())).unwrap();

    // Stored config is pushed right after registration.
    let mut stored = ChannelConfig::new("probe");
    stored
        .config
        .insert("token".to_string(), json!("abc"));
    config::save_channel_config(dir.path(), &stored).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut hub = start_hub(&hub_config, listener).await;
    let mut inbound = hub.router.take_inbound().await.unwrap();

    let (calls_tx, mut calls) = mpsc::unbounded_channel();
    let transport_task = {
        let url = hub.url.clone();
        tokio::spawn(async move {
            let mut plugin = TestPlugin {
                calls: calls_tx,
                ctx: None,
            };
            let transport = PluginTransport::new(&url);
            transport.run(&mut plugin).await
        })
    };

    wait_for_channel(&hub.supervisor, "probe").await;
    expect_call(&mut calls, "on_start", |c| matches!(c, Call::Started)).await;
    let configured = expect_call(&mut calls, "stored config push", |c| {
        matches!(c, Call::Configured(_))
    })
    .await;
    if let Call::Configured(config) = configured {
        assert_eq!(config["token"], "abc");
    }

    // channel.send reaches the plugin's send().
    let outbound = UnifiedMessage::outbound_text("probe", "remote-1", "hello there");
    hub.supervisor
        .send_to_channel("probe", serde_json::to_value(&outbound).unwrap())
        .await;
    let sent = expect_call(&mut calls, "channel.send dispatch", |c| {
        matches!(c, Call::Sent(_))
    })
    .await;
    if let Call::Sent(message) = sent {
        assert_eq!(message.body, "hello there");
        assert_eq!(message.recipient_id.as_deref(), Some("remote-1"));
    }

    // channel.status probe returns a running status.
    let status = hub.supervisor.probe_channel("probe").await.unwrap();
    assert_eq!(status["name"], "probe");
    assert_eq!(status["status"], "running");
    assert!(hub.supervisor.probe_channel("absent").await.is_none());

    // Events flow hub → plugin → hub.
    hub.supervisor
        .send_event_to_channel("probe", "reflect", json!({"n": 7}))
        .await;
    let event = timeout(Duration::from_secs(5), hub.events.recv())
        .await
        .expect("timed out waiting for reflected event")
        .unwrap();
    assert_eq!(event.channel, "probe");
    assert_eq!(event.event, "reflected");
    assert_eq!(event.data["n"], 7);

    // channel.receive flows plugin → router.
    hub.supervisor
        .send_event_to_channel("probe", "emit_message", json!({"body": "ping"}))
        .await;
    let msg = timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("timed out waiting for inbound message")
        .unwrap();
    assert_eq!(msg.channel, "probe");
    assert_eq!(msg.sender_id, "remote-1");
    assert_eq!(msg.body, "ping");

    // Shutdown: the plugin is told to stop, the transport exits cleanly.
    hub.cancel.cancel();
    expect_call(&mut calls, "on_stop", |c| matches!(c, Call::Stopped)).await;
    timeout(Duration::from_secs(5), transport_task)
        .await
        .expect("transport did not stop")
        .unwrap()
        .unwrap();
    timeout(Duration::from_secs(5), hub.task)
        .await
        .expect("supervisor did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn echo_channel_reflects_outbound_as_inbound() {
    let dir = tempfile::tempdir().unwrap();
    let hub_config = Config::load(Some(dir.path().to_path_buf())).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hub = start_hub(&hub_config, listener).await;
    let mut inbound = hub.router.take_inbound().await.unwrap();

    let transport_task = {
        let url = hub.url.clone();
        tokio::spawn(async move {
            let mut plugin = EchoChannel::new();
            let transport = PluginTransport::new(&url);
            transport.run(&mut plugin).await
        })
    };
    wait_for_channel(&hub.supervisor, "echo").await;

    let outbound = UnifiedMessage::outbound_text("echo", "user-1", "round trip");
    hub.supervisor
        .send_to_channel("echo", serde_json::to_value(&outbound).unwrap())
        .await;

    let echoed = timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("timed out waiting for echo")
        .unwrap();
    assert_eq!(echoed.channel, "echo");
    assert_eq!(echoed.body, "[echo] round trip");
    assert_eq!(echoed.sender_id, "echo:user-1");
    assert_eq!(echoed.recipient_id.as_deref(), Some("agent"));

    hub.cancel.cancel();
    let _ = timeout(Duration::from_secs(5), transport_task).await;
}

#[tokio::test]
async fn transport_retries_until_hub_is_reachable() {
    // Reserve a port, release it, and start the plugin before the hub:
    // the first connection attempt fails and the reconnect loop recovers
    // once the hub comes up.
    let probe_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe_listener.local_addr().unwrap();
    drop(probe_listener);

    let (calls_tx, mut calls) = mpsc::unbounded_channel();
    let url = format!("ws://{addr}");
    let transport = Arc::new(PluginTransport::new(&url));
    let transport_task = {
        let transport = transport.clone();
        tokio::spawn(async move {
            let mut plugin = TestPlugin {
                calls: calls_tx,
                ctx: None,
            };
            transport.run(&mut plugin).await
        })
    };

    // Let the first attempt fail, then bring the hub up on the same port.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let dir = tempfile::tempdir().unwrap();
    let hub_config = Config::load(Some(dir.path().to_path_buf())).unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let hub = start_hub(&hub_config, listener).await;

    // Registration happens within one reconnect window.
    wait_for_channel(&hub.supervisor, "probe").await;
    expect_call(&mut calls, "on_start after reconnect", |c| {
        matches!(c, Call::Started)
    })
    .await;

    transport.stop();
    let _ = timeout(Duration::from_secs(5), transport_task).await;
    hub.cancel.cancel();
    let _ = timeout(Duration::from_secs(5), hub.task).await;
}

#[tokio::test]
async fn spawn_failures_do_not_prevent_serving() {
    let dir = tempfile::tempdir().unwrap();
    let hub_config = Config::load(Some(dir.path().to_path_buf())).unwrap();

    // One config with a missing binary, one with a real child that must be
    // terminated at shutdown.
    let mut ghost = ChannelConfig::new("ghost");
    ghost.command = vec!["homelink-no-such-binary".to_string()];
    config::save_channel_config(dir.path(), &ghost).unwrap();
    let mut sleeper = ChannelConfig::new("sleeper");
    sleeper.command = vec!["sleep".to_string(), "60".to_string()];
    config::save_channel_config(dir.path(), &sleeper).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hub = start_hub(&hub_config, listener).await;

    // The server still accepts plugin connections.
    let transport_task = {
        let url = hub.url.clone();
        tokio::spawn(async move {
            let mut plugin = EchoChannel::new();
            let transport = PluginTransport::new(&url);
            transport.run(&mut plugin).await
        })
    };
    wait_for_channel(&hub.supervisor, "echo").await;

    // Shutdown terminates the sleeper child within the grace window.
    hub.cancel.cancel();
    timeout(Duration::from_secs(10), hub.task)
        .await
        .expect("supervisor did not stop (child not terminated?)")
        .unwrap()
        .unwrap();
    let _ = timeout(Duration::from_secs(5), transport_task).await;
}
