use super::*;
use std::{net::Ipv4Addr, sync::Mutex};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use crate::viewer::NoLaunch;

type Viewer = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct RecordingLauncher {
    urls: Mutex<Vec<Url>>,
    fail: bool,
}

impl ViewerLauncher for RecordingLauncher {
    fn launch(&self, url: &Url) -> io::Result<()> {
        self.urls.lock().expect("urls").push(url.clone());
        if self.fail {
            Err(io::Error::other("no browser"))
        } else {
            Ok(())
        }
    }
}

fn config(query: Option<&str>, file: Option<PathBuf>) -> SessionConfig {
    SessionConfig {
        request: SessionRequest {
            query: query.map(str::to_string),
            file,
        },
        control_bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        data_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        data_port: None,
        ack_timeout: None,
        viewer_url: Url::parse("https://parquet-viewer.xiangpeng.systems/").expect("url"),
    }
}

fn coordinator(config: SessionConfig) -> SessionCoordinator {
    SessionCoordinator::new(config, Arc::new(NoLaunch), Span::none()).expect("coordinator")
}

fn fixture(len: usize) -> (tempfile::TempDir, PathBuf, Vec<u8>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("hits.parquet");
    let bytes: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
    std::fs::write(&path, &bytes).expect("fixture");
    (dir, path, bytes)
}

async fn connect_viewer(addresses: &SessionAddresses) -> Viewer {
    let (viewer, _) = connect_async(format!("ws://{}/", addresses.control))
        .await
        .expect("connect viewer");
    viewer
}

async fn next_instruction(viewer: &mut Viewer) -> Instruction {
    match viewer.next().await.expect("frame").expect("message") {
        Message::Text(text) => serde_json::from_str(&text).expect("instruction"),
        other => panic!("expected instruction, got {other:?}"),
    }
}

async fn send_ack(viewer: &mut Viewer) {
    viewer
        .send(Message::Text(r#"{"message_type":"ack"}"#.into()))
        .await
        .expect("send ack");
}

async fn finish(coordinator: &mut SessionCoordinator) -> SessionReport {
    tokio::time::timeout(Duration::from_secs(20), coordinator.wait())
        .await
        .expect("session ends in bounded time")
        .expect("report")
}

async fn assert_closed(addr: SocketAddr) {
    assert!(
        TcpStream::connect(addr).await.is_err(),
        "listener on {addr} should be closed"
    );
}

fn http_client() -> reqwest::Client {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("client")
}

#[tokio::test]
async fn file_session_serves_range_then_shuts_down_on_ack() {
    let (_dir, path, bytes) = fixture(1000);
    let mut coordinator = coordinator(config(None, Some(path)));
    assert_eq!(coordinator.state(), SessionState::Idle);

    let addresses = coordinator.start().await.expect("start");
    assert_eq!(coordinator.state(), SessionState::AwaitingAck);
    let data = addresses.data.clone().expect("data plane address");

    let mut viewer = connect_viewer(&addresses).await;
    let Instruction::ParquetFile(instruction) = next_instruction(&mut viewer).await else {
        panic!("expected a file instruction");
    };
    assert_eq!(instruction.file_name.as_str(), "hits.parquet");
    assert_eq!(instruction.server_address, data);

    let url = instruction
        .server_address
        .file_url(&instruction.file_name);
    let client = http_client();
    let response = client
        .get(url.clone())
        .header("Range", "bytes=500-")
        .send()
        .await
        .expect("range request");
    assert_eq!(response.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok()),
        Some("bytes 500-999/1000")
    );
    let body = response.bytes().await.expect("body");
    assert_eq!(body.as_ref(), &bytes[500..]);

    let full = client.get(url).send().await.expect("full request");
    assert_eq!(full.status(), reqwest::StatusCode::OK);
    assert_eq!(full.bytes().await.expect("body").as_ref(), bytes.as_slice());

    send_ack(&mut viewer).await;
    let report = finish(&mut coordinator).await;
    assert_eq!(report.outcome, SessionOutcome::Acknowledged);
    assert_eq!(report.data, Some(data.clone()));
    assert_eq!(report.stopped, vec!["data", "control"]);
    assert_eq!(report.to_string(), format!("acknowledged; served from {data}"));
    assert_eq!(coordinator.state(), SessionState::Completed);

    let data_port = data.port().expect("port");
    assert_closed(SocketAddr::from((Ipv4Addr::LOCALHOST, data_port))).await;
    assert_closed(addresses.control).await;
}

#[tokio::test]
async fn zero_length_file_round_trips_through_instruction_address() {
    let (_dir, path, _bytes) = fixture(0);
    let mut coordinator = coordinator(config(None, Some(path)));
    let addresses = coordinator.start().await.expect("start");

    let mut viewer = connect_viewer(&addresses).await;
    let Instruction::ParquetFile(instruction) = next_instruction(&mut viewer).await else {
        panic!("expected a file instruction");
    };
    let response = http_client()
        .get(instruction.server_address.file_url(&instruction.file_name))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.bytes().await.expect("body").is_empty());

    send_ack(&mut viewer).await;
    assert_eq!(finish(&mut coordinator).await.outcome, SessionOutcome::Acknowledged);
}

#[tokio::test]
async fn query_session_sends_only_the_sql_instruction() {
    let mut coordinator = coordinator(config(Some("SELECT 1"), None));
    let addresses = coordinator.start().await.expect("start");
    assert!(addresses.data.is_none());

    let mut viewer = connect_viewer(&addresses).await;
    match viewer.next().await.expect("frame").expect("message") {
        Message::Text(text) => assert_eq!(text, r#"{"sql":{"query":"SELECT 1"}}"#),
        other => panic!("expected instruction, got {other:?}"),
    }

    viewer
        .send(Message::Text(r#"{"message_type":"nope"}"#.into()))
        .await
        .expect("send nope");
    send_ack(&mut viewer).await;

    // Nothing but the closing handshake follows the instruction.
    while let Some(Ok(frame)) = viewer.next().await {
        assert!(matches!(frame, Message::Close(_)), "unexpected frame {frame:?}");
    }

    let report = finish(&mut coordinator).await;
    assert_eq!(report.outcome, SessionOutcome::Acknowledged);
    assert!(report.data.is_none());
    assert_eq!(report.stopped, vec!["control"]);
    assert_eq!(report.to_string(), "acknowledged");
    assert_closed(addresses.control).await;
}

#[tokio::test]
async fn ack_timeout_applies_before_any_viewer_connects() {
    let mut config = config(Some("SELECT 1"), None);
    config.ack_timeout = Some(Duration::from_millis(200));
    let mut coordinator = coordinator(config);
    let addresses = coordinator.start().await.expect("start");

    let report = finish(&mut coordinator).await;
    assert_eq!(report.outcome, SessionOutcome::TimedOut);
    assert_eq!(coordinator.state(), SessionState::Completed);
    assert_closed(addresses.control).await;
}

#[tokio::test]
async fn timed_out_file_session_stops_data_plane_before_control_channel() {
    let (_dir, path, _bytes) = fixture(10);
    let mut config = config(None, Some(path));
    config.ack_timeout = Some(Duration::from_millis(200));
    let mut coordinator = coordinator(config);
    let addresses = coordinator.start().await.expect("start");
    let data_port = addresses.data.as_ref().and_then(ServerAddress::port).expect("port");

    let report = finish(&mut coordinator).await;
    assert_eq!(report.outcome, SessionOutcome::TimedOut);
    assert_eq!(report.stopped, vec!["data", "control"]);
    assert_closed(SocketAddr::from((Ipv4Addr::LOCALHOST, data_port))).await;
    assert_closed(addresses.control).await;
}

#[tokio::test]
async fn viewer_leaving_without_ack_ends_the_session() {
    let mut coordinator = coordinator(config(Some("SELECT 1"), None));
    let addresses = coordinator.start().await.expect("start");

    let mut viewer = connect_viewer(&addresses).await;
    next_instruction(&mut viewer).await;
    viewer.close(None).await.expect("close");

    let report = finish(&mut coordinator).await;
    assert_eq!(report.outcome, SessionOutcome::ClientDisconnected);
}

#[tokio::test]
async fn file_removed_before_viewer_connects_aborts_the_session() {
    let (_dir, path, _bytes) = fixture(10);
    let mut coordinator = coordinator(config(None, Some(path.clone())));
    let addresses = coordinator.start().await.expect("start");
    std::fs::remove_file(&path).expect("remove");

    let mut viewer = connect_viewer(&addresses).await;
    match viewer.next().await {
        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("no instruction expected, got {other:?}"),
    }

    let report = finish(&mut coordinator).await;
    assert!(matches!(report.outcome, SessionOutcome::Aborted(_)));
}

#[tokio::test]
async fn launcher_receives_viewer_url_and_its_failure_is_not_fatal() {
    let (_dir, path, _bytes) = fixture(10);
    let launcher = Arc::new(RecordingLauncher {
        fail: true,
        ..RecordingLauncher::default()
    });
    let mut coordinator =
        SessionCoordinator::new(config(None, Some(path)), launcher.clone(), Span::none())
            .expect("coordinator");

    let addresses = coordinator.start().await.expect("start despite launch failure");
    let data = addresses.data.clone().expect("data");
    let launched = launcher.urls.lock().expect("urls").clone();
    assert_eq!(launched, vec![addresses.viewer_url.clone()]);

    let target = launched[0]
        .query_pairs()
        .find(|(key, _)| key == "url")
        .map(|(_, value)| value.into_owned())
        .expect("url parameter");
    assert_eq!(target, format!("{data}/hits.parquet"));

    let mut viewer = connect_viewer(&addresses).await;
    next_instruction(&mut viewer).await;
    send_ack(&mut viewer).await;
    finish(&mut coordinator).await;
}

#[tokio::test]
async fn control_bind_failure_is_reported_and_data_plane_released() {
    let (_dir, path, _bytes) = fixture(10);
    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("occupy");
    let data_port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe");
        probe.local_addr().expect("addr").port()
    };

    let mut config = config(None, Some(path));
    config.control_bind = occupied.local_addr().expect("addr");
    config.data_port = Some(data_port);
    let mut coordinator = coordinator(config);

    match coordinator.start().await {
        Err(SessionError::Bind { role, .. }) => assert_eq!(role, "control"),
        Err(other) => panic!("expected bind error, got {other}"),
        Ok(_) => panic!("control bind should fail"),
    }
    assert_eq!(coordinator.state(), SessionState::Idle);
    assert_closed(SocketAddr::from((Ipv4Addr::LOCALHOST, data_port))).await;
}

#[tokio::test]
async fn explicit_data_port_is_embedded_in_the_instruction() {
    let (_dir, path, _bytes) = fixture(10);
    let data_port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe");
        probe.local_addr().expect("addr").port()
    };
    let mut config = config(None, Some(path));
    config.data_port = Some(data_port);
    let mut coordinator = coordinator(config);

    let addresses = coordinator.start().await.expect("start");
    let mut viewer = connect_viewer(&addresses).await;
    let Instruction::ParquetFile(instruction) = next_instruction(&mut viewer).await else {
        panic!("expected a file instruction");
    };
    assert_eq!(
        instruction.server_address.to_string(),
        format!("http://127.0.0.1:{data_port}")
    );

    send_ack(&mut viewer).await;
    finish(&mut coordinator).await;
}

#[test]
fn empty_request_is_rejected() {
    let result = SessionCoordinator::new(config(None, None), Arc::new(NoLaunch), Span::none());
    assert!(matches!(result, Err(SessionError::NothingToServe)));
}

#[tokio::test]
async fn wait_before_start_is_an_invalid_transition() {
    let mut coordinator = coordinator(config(Some("SELECT 1"), None));
    match coordinator.wait().await {
        Err(SessionError::InvalidState { expected, actual }) => {
            assert_eq!(expected, SessionState::AwaitingAck);
            assert_eq!(actual, SessionState::Idle);
        }
        other => panic!("expected invalid state, got ok={}", other.is_ok()),
    }
}
