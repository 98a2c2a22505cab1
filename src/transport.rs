//! Bidirectional message transport used by the live connection.
//!
//! A transport is a pair of channels: frames to send, and events received. The default
//! [`WebSocketTransportFactory`] drives a WebSocket on a spawned task; tests plug in an
//! in-memory transport instead.
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};

use crate::{Error, Result};

/// Abnormal closure: the connection was lost without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// No status code was present in the close frame.
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingFrame {
    Text(String),
    /// Close the connection normally. Nothing is sent after this frame.
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(String),
    /// Transport-level keepalive.
    Ping,
    Close { code: u16, reason: String },
    Error(String),
}

/// One open transport. Dropping `outgoing` closes the connection.
pub struct TransportConnection {
    pub outgoing: mpsc::UnboundedSender<OutgoingFrame>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports to an address.
///
/// `open` returns as soon as the connection attempt has started. Whether it succeeded is
/// reported through the event channel: [`TransportEvent::Open`] or [`TransportEvent::Close`].
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, address: &str) -> Result<TransportConnection>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransportFactory;

#[async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn open(&self, address: &str) -> Result<TransportConnection> {
        let url = url::Url::parse(address).map_err(Error::InvalidBaseUrl)?;
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();

        tokio::spawn(run_websocket(url, outgoing_rx, events_tx));

        Ok(TransportConnection { outgoing, events })
    }
}

async fn run_websocket(
    url: url::Url,
    mut outgoing: mpsc::UnboundedReceiver<OutgoingFrame>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let emit = |event| {
        // Receiver gone means the connection was torn down, nothing left to report to.
        let _ = events.send(event);
    };
    let abnormal = |reason: String| TransportEvent::Close {
        code: CLOSE_ABNORMAL,
        reason,
    };

    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(err) => {
            log::debug!(target: "featureboard", "websocket connect failed: {err}");
            emit(TransportEvent::Error(err.to_string()));
            emit(abnormal(err.to_string()));
            return;
        }
    };
    emit(TransportEvent::Open);

    let (mut write, mut read) = ws_stream.split();
    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(OutgoingFrame::Text(text)) => {
                    if let Err(err) = write.send(Message::Text(text)).await {
                        emit(TransportEvent::Error(err.to_string()));
                        emit(abnormal(err.to_string()));
                        return;
                    }
                }
                Some(OutgoingFrame::Close) | None => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    let _ = write.close().await;
                    return;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => emit(TransportEvent::Message(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => emit(TransportEvent::Message(text)),
                    Err(err) => emit(TransportEvent::Error(format!("non-utf8 frame: {err}"))),
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => emit(TransportEvent::Ping),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.into_owned()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    emit(TransportEvent::Close { code, reason });
                    return;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(err)) => {
                    emit(TransportEvent::Error(err.to_string()));
                    emit(abnormal(err.to_string()));
                    return;
                }
                None => {
                    emit(abnormal("connection lost".to_owned()));
                    return;
                }
            },
        }
    }
}
