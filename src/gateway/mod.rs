//! Gateway — WebSocket relay server for authenticated devices.
//!
//! The gateway multiplexes device connections, relays application frames
//! between them (unicast or broadcast), and bridges out-of-band pairing
//! requests from unauthenticated mobile devices to the connected desktop.
//! Trust is anchored to a single desktop Ed25519 key (see [`auth`]).

pub mod auth;
pub mod relay;

pub use auth::{generate_nonce, AuthError, AuthStore};
pub use relay::{handle_connection, RelayState, AUTH_TIMEOUT, PAIRING_WAIT};

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// WebSocket close codes on the gateway wire.
pub mod close {
    /// Normal closure after a completed pairing exchange.
    pub const NORMAL: u16 = 1000;
    /// Displaced by a newer connection for the same device id.
    pub const REPLACED: u16 = 4000;
    /// Missing device id. Legacy code from the pre-handshake protocol;
    /// defined so old clients can still interpret it, never emitted.
    pub const MISSING_DEVICE_ID: u16 = 4001;
    /// Authentication failure or handshake timeout.
    pub const AUTH_FAILED: u16 = 4003;
    /// Malformed pairing request.
    pub const PAIRING_MALFORMED: u16 = 4004;
    /// Pairing requested while no desktop is connected.
    pub const DESKTOP_NOT_CONNECTED: u16 = 4006;
    /// Pairing caller waited too long for the desktop's answer.
    pub const PAIRING_TIMEOUT: u16 = 4008;
}

/// Accept connections until cancelled. Each connection runs independently;
/// per-connection failures are logged, never fatal to the server.
pub async fn serve(
    listener: TcpListener,
    state: Arc<RelayState>,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!("gateway listening on ws://{}", listener.local_addr()?);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = relay::handle_connection(state, stream).await {
                        tracing::warn!("gateway connection error from {peer}: {err:#}");
                    }
                });
            }
        }
    }
    tracing::info!("gateway stopped");
    Ok(())
}
