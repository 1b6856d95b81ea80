//! WebSocket connect endpoint for devices.
//!
//! A device connects with `GET /api/v2/device` and the
//! `X-Webpa-Device-Name` header. [`device_id_middleware`] resolves the
//! identity into the request extensions, [`connect_handler`] performs the
//! upgrade and hands the socket to the [`Manager`].

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, warn};

use crate::device::transport::{Frame, FrameReader, FrameWriter, Transport, TransportError};
use crate::device::{ConnectRequest, DeviceError, DeviceId, Manager};
use crate::server::http::HubState;

/// Header carrying the connecting device's name.
pub static DEVICE_NAME_HEADER: HeaderName = HeaderName::from_static("x-webpa-device-name");

/// Header advertising the hub's device limit.
pub static MAX_DEVICES_HEADER: HeaderName = HeaderName::from_static("x-xmidt-max-devices");

/// An upgraded axum socket.
pub struct WebSocketTransport(pub WebSocket);

pub struct WebSocketReader(SplitStream<WebSocket>);

pub struct WebSocketWriter(SplitSink<WebSocket, Message>);

#[async_trait]
impl Transport for WebSocketTransport {
    type Reader = WebSocketReader;
    type Writer = WebSocketWriter;

    async fn upgrade(self) -> Result<(Self::Reader, Self::Writer), TransportError> {
        let (sink, stream) = self.0.split();
        Ok((WebSocketReader(stream), WebSocketWriter(sink)))
    }
}

#[async_trait]
impl FrameReader for WebSocketReader {
    async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        match self.0.next().await {
            None => Err(TransportError::Closed),
            Some(Err(e)) => Err(TransportError::Io(e.to_string())),
            Some(Ok(message)) => Ok(match message {
                Message::Binary(data) => Frame::Binary(data),
                Message::Text(text) => Frame::Text(text.as_str().to_owned()),
                Message::Ping(data) => Frame::Ping(data),
                Message::Pong(data) => Frame::Pong(data),
                Message::Close(_) => Frame::Close,
            }),
        }
    }
}

#[async_trait]
impl FrameWriter for WebSocketWriter {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Binary(data) => Message::Binary(data),
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        };
        self.0
            .send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // The peer may already be gone; the close frame is best effort.
        let _ = self.0.send(Message::Close(None)).await;
        self.0
            .close()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

fn error_body(status: StatusCode, error: &DeviceError) -> Response {
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

/// Resolve the device name header into a [`DeviceId`] extension.
///
/// Requests without the header pass through untouched so the handler can
/// report the missing identity; malformed names are rejected here.
pub async fn device_id_middleware(mut request: Request, next: Next) -> Response {
    let parsed = request.headers().get(&DEVICE_NAME_HEADER).map(|value| {
        value
            .to_str()
            .map_err(|_| {
                DeviceError::InvalidDeviceName(String::from_utf8_lossy(value.as_bytes()).into_owned())
            })
            .and_then(DeviceId::parse)
    });
    match parsed {
        None => next.run(request).await,
        Some(Ok(id)) => {
            request.extensions_mut().insert(id);
            next.run(request).await
        }
        Some(Err(e)) => {
            debug!(target: "ws", error = %e, "rejecting connect with bad device name");
            error_body(StatusCode::BAD_REQUEST, &e)
        }
    }
}

pub fn max_devices_value(manager: &Manager) -> HeaderValue {
    HeaderValue::from(manager.max_devices())
}

/// `GET /api/v2/device`
pub async fn connect_handler(State(state): State<HubState>, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();
    let max_devices = max_devices_value(&state.manager);

    let Some(id) = parts.extensions.get::<DeviceId>().cloned() else {
        let mut response =
            error_body(StatusCode::INTERNAL_SERVER_ERROR, &DeviceError::MissingDeviceName);
        response
            .headers_mut()
            .insert(MAX_DEVICES_HEADER.clone(), max_devices);
        return response;
    };

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            warn!(target: "ws", device_id = id.as_str(), error = %rejection, "upgrade rejected");
            let mut response = rejection.into_response();
            response
                .headers_mut()
                .insert(MAX_DEVICES_HEADER.clone(), max_devices);
            return response;
        }
    };

    let connect = ConnectRequest {
        id: Some(id.clone()),
        headers: parts.headers,
    };
    let manager = state.manager.clone();
    let failed_id = id.clone();

    let mut response = upgrade
        .on_failed_upgrade(move |e| {
            warn!(target: "ws", device_id = failed_id.as_str(), error = %e, "websocket upgrade failed");
        })
        .on_upgrade(move |socket| async move {
            if let Err(e) = manager.connect(connect, WebSocketTransport(socket)).await {
                warn!(target: "ws", device_id = id.as_str(), error = %e, "device connect refused");
            }
        });
    response
        .headers_mut()
        .insert(MAX_DEVICES_HEADER.clone(), max_devices);
    response
}
