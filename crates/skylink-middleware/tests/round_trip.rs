//! Bus traffic through a real transport and a loopback WebSocket server.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use skylink_middleware::{BoxError, BusConfig, DeviceLink, Flow, TopicFilter};
use skylink_transport::TransportConfig;
use skylink_types::LinkError;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const WAIT: Duration = Duration::from_secs(5);

/// Accept one client and echo every data frame back to it.
async fn echo_server() -> Result<String, Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}/ws", listener.local_addr()?);
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else { return };
        let Ok(mut ws) = accept_async(stream).await else { return };
        while let Some(Ok(msg)) = ws.next().await {
            if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                break;
            }
        }
    });
    Ok(url)
}

fn recorder(
    tx: mpsc::UnboundedSender<(Value, String)>,
) -> impl Fn(&Value, &str) -> Result<(), BoxError> + Send + Sync + 'static {
    move |data: &Value, topic: &str| {
        let _ = tx.send((data.clone(), topic.to_string()));
        Ok(())
    }
}

#[tokio::test]
async fn published_envelope_loops_back_to_one_handler() -> TestResult {
    let url = echo_server().await?;
    let link = DeviceLink::connect(TransportConfig::new(url), BusConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    link.bus().subscribe("t", recorder(tx));

    link.bus().publish("t", &json!({ "x": 1 }));

    let (data, topic) = tokio::time::timeout(WAIT, rx.recv()).await?.ok_or("closed")?;
    assert_eq!(data, json!({ "x": 1 }));
    assert_eq!(topic, "t");
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
        "exactly one invocation expected"
    );

    link.shutdown();
    Ok(())
}

#[tokio::test]
async fn publish_accepts_any_serialisable_value() -> TestResult {
    #[derive(serde::Serialize)]
    struct Slew {
        ra: f64,
        dec: f64,
    }

    let url = echo_server().await?;
    let link = DeviceLink::connect(TransportConfig::new(url), BusConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    link.bus().subscribe("mount/slew", recorder(tx));

    link.bus().publish("mount/slew", &Slew { ra: 10.5, dec: -3.25 });

    let (data, _) = tokio::time::timeout(WAIT, rx.recv()).await?.ok_or("closed")?;
    assert_eq!(data, json!({ "ra": 10.5, "dec": -3.25 }));
    Ok(())
}

#[tokio::test]
async fn raw_server_frames_reach_the_default_topic() -> TestResult {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}/ws", listener.local_addr()?);
    let link = DeviceLink::connect(TransportConfig::new(url), BusConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    link.bus().subscribe("default", recorder(tx));

    let (stream, _) = tokio::time::timeout(WAIT, listener.accept()).await??;
    let mut server = accept_async(stream).await?;
    server.send(Message::Text(r#"{"status":"idle"}"#.into())).await?;

    let (data, topic) = tokio::time::timeout(WAIT, rx.recv()).await?.ok_or("closed")?;
    assert_eq!(topic, "default");
    assert_eq!(data, json!({ "status": "idle" }));
    Ok(())
}

#[tokio::test]
async fn raw_text_frames_are_unwrapped_or_defaulted() -> TestResult {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}/ws", listener.local_addr()?);
    let link = DeviceLink::connect(TransportConfig::new(url), BusConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    link.bus().subscribe("darks/progress", recorder(tx.clone()));
    link.bus().subscribe("default", recorder(tx));

    let (stream, _) = tokio::time::timeout(WAIT, listener.accept()).await??;
    let mut server = accept_async(stream).await?;
    let wrapped = STANDARD.encode(r#"{"topic":"darks/progress","data":3}"#);
    server.send(Message::Text(wrapped.into())).await?;
    server.send(Message::Text("hello".into())).await?;

    let (data, topic) = tokio::time::timeout(WAIT, rx.recv()).await?.ok_or("closed")?;
    assert_eq!((data, topic.as_str()), (json!(3), "darks/progress"));
    let (data, topic) = tokio::time::timeout(WAIT, rx.recv()).await?.ok_or("closed")?;
    assert_eq!((data, topic.as_str()), (json!("hello"), "default"));
    Ok(())
}

#[tokio::test]
async fn filter_blocks_looped_back_topics() -> TestResult {
    let url = echo_server().await?;
    let link = DeviceLink::connect(TransportConfig::new(url), BusConfig::default());
    link.bus()
        .use_middleware(TopicFilter::allow(["allowed"]))
        .use_middleware(|_: &str, data: Value| -> Result<Flow, LinkError> {
            Ok(Flow::Continue(data))
        });
    let (tx, mut rx) = mpsc::unbounded_channel();
    link.bus().subscribe("blocked", recorder(tx.clone()));
    link.bus().subscribe("allowed", recorder(tx));

    link.bus().publish("blocked", &1);
    link.bus().publish("allowed", &2);

    let (data, topic) = tokio::time::timeout(WAIT, rx.recv()).await?.ok_or("closed")?;
    assert_eq!((data, topic.as_str()), (json!(2), "allowed"));
    assert!(rx.try_recv().is_err());
    Ok(())
}
