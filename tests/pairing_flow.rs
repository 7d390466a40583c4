//! End-to-end pairing bridge tests: a mobile caller, the gateway, and the
//! hub-side pairing controller behind a real desktop connection.

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use futures_util::{SinkExt, StreamExt};
use homelink::crypto;
use homelink::gateway::{self, AuthStore, RelayState};
use homelink::pairing::{self, PairingController};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start_gateway(state_dir: &std::path::Path) -> (String, CancellationToken) {
    let auth = AuthStore::open(state_dir.join("gateway_state.json"), None).unwrap();
    let state = Arc::new(RelayState::new(auth));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = gateway::serve(listener, state, cancel).await;
        });
    }
    (format!("ws://{addr}"), cancel)
}

async fn send_json(ws: &mut Ws, value: &Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let frame = ws
            .next()
            .await
            .expect("socket closed while waiting for a frame")
            .expect("websocket error");
        match frame {
            Message::Text(raw) => return serde_json::from_str(raw.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn recv_close(ws: &mut Ws) -> (u16, String) {
    loop {
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                return (u16::from(frame.code), frame.reason.to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => panic!("websocket error before close frame: {err}"),
            None => panic!("stream ended without a close frame"),
        }
    }
}

async fn connect_desktop(url: &str, key: &SigningKey) -> Ws {
    let mut ws = tokio_tungstenite::connect_async(url).await.unwrap().0;
    let challenge = recv_json(&mut ws).await;
    let nonce = challenge["nonce"].as_str().unwrap();
    send_json(
        &mut ws,
        &json!({
            "type": "auth_response",
            "auth_mode": "desktop_claim",
            "device_id": "desk-1",
            "public_key": crypto::public_key_b64(key),
            "nonce_signature": crypto::sign_nonce_hex(key, nonce).unwrap(),
        }),
    )
    .await;
    assert_eq!(recv_json(&mut ws).await["type"], "auth_ok");
    ws
}

/// Connect a pairing caller: consume the challenge and send the
/// pairing_request as the first frame.
async fn connect_pairing_caller(url: &str, first_frame: &Value) -> Ws {
    let mut ws = tokio_tungstenite::connect_async(url).await.unwrap().0;
    let challenge = recv_json(&mut ws).await;
    assert_eq!(challenge["type"], "auth_challenge");
    send_json(&mut ws, first_frame).await;
    ws
}

#[tokio::test]
async fn pairing_happy_path_issues_usable_attestation() {
    let gateway_dir = tempfile::tempdir().unwrap();
    let hub_dir = tempfile::tempdir().unwrap();
    let (url, cancel) = start_gateway(gateway_dir.path()).await;

    let desktop_key = crypto::generate_signing_key();
    let mut desktop = connect_desktop(&url, &desktop_key).await;

    // Hub side: active pairing session + controller.
    let session = pairing::create_pairing_session(6, 300).unwrap();
    pairing::save_pairing_session(hub_dir.path(), &session).unwrap();
    let controller = PairingController::new(
        desktop_key.clone(),
        hub_dir.path().to_path_buf(),
        30,
    );

    // Mobile requests pairing with the session code and a fresh key.
    let mobile_key = crypto::generate_signing_key();
    let mut mobile = connect_pairing_caller(
        &url,
        &json!({
            "type": "pairing_request",
            "pairing_code": session.code,
            "device_public_key": crypto::public_key_b64(&mobile_key),
        }),
    )
    .await;

    let pending = recv_json(&mut mobile).await;
    assert_eq!(pending["type"], "pairing_pending");
    let request_id = pending["request_id"].as_str().unwrap().to_string();

    // The desktop channel receives the bridged request and the hub
    // resolves it through the pairing controller.
    let bridged = recv_json(&mut desktop).await;
    assert_eq!(bridged["type"], "pairing_request");
    assert_eq!(bridged["request_id"], request_id.as_str());
    assert_eq!(bridged["pairing_code"], session.code.as_str());

    let response = controller.handle_request(&bridged).unwrap();
    assert_eq!(response["status"], "approved");
    let mut frame = response.clone();
    frame["type"] = json!("pairing_response");
    send_json(&mut desktop, &frame).await;

    // The mobile gets the approval, then a normal close.
    let approved = recv_json(&mut mobile).await;
    assert_eq!(approved["type"], "pairing_response");
    assert_eq!(approved["status"], "approved");
    let device_id = approved["device_id"].as_str().unwrap().to_string();
    assert!(device_id.starts_with("mobile-"));
    let attestation = approved["attestation"].clone();
    let (code, _reason) = recv_close(&mut mobile).await;
    assert_eq!(code, gateway::close::NORMAL);

    // Session consumed, device persisted.
    assert!(pairing::load_pairing_session(hub_dir.path()).is_none());
    let devices = pairing::load_approved_devices(hub_dir.path());
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_id, device_id);

    // Full circle: the issued attestation authenticates a device session.
    let mut paired = tokio_tungstenite::connect_async(url.as_str()).await.unwrap().0;
    let challenge = recv_json(&mut paired).await;
    let nonce = challenge["nonce"].as_str().unwrap();
    send_json(
        &mut paired,
        &json!({
            "type": "auth_response",
            "auth_mode": "device",
            "attestation": attestation,
            "nonce_signature": crypto::sign_nonce_hex(&mobile_key, nonce).unwrap(),
        }),
    )
    .await;
    let ok = recv_json(&mut paired).await;
    assert_eq!(ok["type"], "auth_ok");
    assert_eq!(ok["device_id"], device_id.as_str());
    cancel.cancel();
}

#[tokio::test]
async fn pairing_wrong_code_is_rejected() {
    let gateway_dir = tempfile::tempdir().unwrap();
    let hub_dir = tempfile::tempdir().unwrap();
    let (url, cancel) = start_gateway(gateway_dir.path()).await;

    let desktop_key = crypto::generate_signing_key();
    let mut desktop = connect_desktop(&url, &desktop_key).await;

    let session = pairing::create_pairing_session(6, 300).unwrap();
    pairing::save_pairing_session(hub_dir.path(), &session).unwrap();
    let controller =
        PairingController::new(desktop_key.clone(), hub_dir.path().to_path_buf(), 30);

    let mobile_key = crypto::generate_signing_key();
    let mut mobile = connect_pairing_caller(
        &url,
        &json!({
            "type": "pairing_request",
            "pairing_code": "000000",
            "device_public_key": crypto::public_key_b64(&mobile_key),
        }),
    )
    .await;
    assert_eq!(recv_json(&mut mobile).await["type"], "pairing_pending");

    let bridged = recv_json(&mut desktop).await;
    let response = controller.handle_request(&bridged).unwrap();
    assert_eq!(response["status"], "rejected");
    assert_eq!(response["reason"], "pairing_code_invalid_or_expired");
    let mut frame = response.clone();
    frame["type"] = json!("pairing_response");
    send_json(&mut desktop, &frame).await;

    let rejected = recv_json(&mut mobile).await;
    assert_eq!(rejected["status"], "rejected");
    assert_eq!(rejected["reason"], "pairing_code_invalid_or_expired");
    assert!(rejected.get("attestation").is_none());
    assert!(rejected.get("device_id").is_none());
    let (code, _reason) = recv_close(&mut mobile).await;
    assert_eq!(code, gateway::close::NORMAL);

    // No device was approved.
    assert!(pairing::load_approved_devices(hub_dir.path()).is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn pairing_without_desktop_closes_4006() {
    let gateway_dir = tempfile::tempdir().unwrap();
    let (url, cancel) = start_gateway(gateway_dir.path()).await;

    let mut mobile = connect_pairing_caller(
        &url,
        &json!({
            "type": "pairing_request",
            "pairing_code": "123456",
            "device_public_key": "anything",
        }),
    )
    .await;
    let (code, reason) = recv_close(&mut mobile).await;
    assert_eq!(code, gateway::close::DESKTOP_NOT_CONNECTED);
    assert_eq!(reason, "desktop not connected");
    cancel.cancel();
}

#[tokio::test]
async fn malformed_pairing_request_closes_4004() {
    let gateway_dir = tempfile::tempdir().unwrap();
    let (url, cancel) = start_gateway(gateway_dir.path()).await;
    let desktop_key = crypto::generate_signing_key();
    let _desktop = connect_desktop(&url, &desktop_key).await;

    let mut mobile = connect_pairing_caller(
        &url,
        &json!({
            "type": "pairing_request",
            "pairing_code": "123456"
        }),
    )
    .await;
    let (code, reason) = recv_close(&mut mobile).await;
    assert_eq!(code, gateway::close::PAIRING_MALFORMED);
    assert_eq!(reason, "device_public_key is required");
    cancel.cancel();
}
