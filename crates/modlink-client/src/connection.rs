//! Socket setup: dialing the server, the `CONNECT` greeting and frame
//! conversion.

use std::pin::Pin;

use futures::stream::BoxStream;
use futures::{Sink, StreamExt};
use modlink_core::{
    Address, ChannelError, Codec, Event, Payload, Protocol, Request, Response, Result, Target, TlsOptions,
};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{Connector, WebSocketStream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;
use url::Url;

/// Write half of a client socket.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Read half of a client socket.
pub type FrameStream = BoxStream<'static, std::result::Result<Message, WsError>>;

/// An upgraded socket, split into halves.
pub struct Socket {
    /// Write half.
    pub sink: FrameSink,
    /// Read half.
    pub stream: FrameStream,
}

/// Contents of the server's `CONNECT` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// Server id, used as the routing key for this client's modules.
    pub server_id: String,
    /// Codec the server settled on.
    pub codec: Codec,
}

/// Upgrade URL carrying `id`, `secret` and `codec` query parameters.
pub fn handshake_url(address: &Address, client_id: &str) -> Result<Url> {
    let base = match address.protocol() {
        Protocol::WsUnix => "ws://localhost/".to_owned(),
        Protocol::Ws | Protocol::Wss => address.dsn(),
    };
    let mut url = Url::parse(&base).map_err(|e| ChannelError::InvalidAddress(format!("{base}: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        let _ = query.append_pair("id", client_id);
        if let Some(secret) = address.secret() {
            let _ = query.append_pair("secret", secret);
        }
        let _ = query.append_pair("codec", address.codec().as_str());
    }
    Ok(url)
}

/// Open a socket to `address` and wait for the server's greeting. `wss:`
/// addresses are verified with `tls`.
pub async fn dial(address: &Address, client_id: &str, tls: &TlsOptions) -> Result<(Socket, Greeting)> {
    let url = handshake_url(address, client_id)?;
    let mut socket = match address.protocol() {
        Protocol::WsUnix => dial_unix(address, &url).await?,
        Protocol::Ws => {
            let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(handshake_error)?;
            split_socket(ws)
        }
        Protocol::Wss => {
            let connector = Connector::Rustls(tls.client_config()?);
            let (ws, _) = tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, Some(connector))
                .await
                .map_err(handshake_error)?;
            split_socket(ws)
        }
    };
    let greeting = read_greeting(&mut socket.stream, address.codec()).await?;
    debug!(server_id = %greeting.server_id, codec = %greeting.codec, "handshake complete");
    Ok((socket, greeting))
}

#[cfg(unix)]
async fn dial_unix(address: &Address, url: &Url) -> Result<Socket> {
    let path = address
        .socket_path()
        .ok_or_else(|| ChannelError::InvalidAddress(format!("{address} has no socket path")))?;
    let stream = tokio::net::UnixStream::connect(path)
        .await
        .map_err(|e| handshake_failed(format!("cannot connect to {address}: {e}")))?;
    let (ws, _) = tokio_tungstenite::client_async(url.as_str(), stream)
        .await
        .map_err(handshake_error)?;
    Ok(split_socket(ws))
}

#[cfg(not(unix))]
async fn dial_unix(address: &Address, _url: &Url) -> Result<Socket> {
    Err(ChannelError::InvalidAddress(format!(
        "{address}: unix sockets are not supported on this platform"
    )))
}

fn split_socket<S>(ws: WebSocketStream<S>) -> Socket
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    Socket {
        sink: Box::pin(sink),
        stream: stream.boxed(),
    }
}

async fn read_greeting(stream: &mut FrameStream, requested: Codec) -> Result<Greeting> {
    loop {
        let payload = match stream.next().await {
            Some(Ok(message)) => match classify(message) {
                Inbound::Data(payload) => payload,
                Inbound::Control => continue,
                Inbound::Closed => return Err(handshake_failed("socket closed before the greeting")),
            },
            Some(Err(err)) => return Err(handshake_error(err)),
            None => return Err(handshake_failed("socket closed before the greeting")),
        };
        let frame: Response = requested
            .decode(&payload)
            .map_err(|e| handshake_failed(format!("malformed greeting: {e}")))?;
        return match (frame.event, frame.target) {
            (Event::Connect, Target::Name(server_id)) => {
                let codec = frame
                    .data
                    .as_ref()
                    .and_then(Value::as_str)
                    .and_then(Codec::parse)
                    .unwrap_or(requested);
                Ok(Greeting { server_id, codec })
            }
            (event, _) => Err(handshake_failed(format!("expected a CONNECT greeting, got {event}"))),
        };
    }
}

/// Kind of an incoming socket message.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Text or binary frame body.
    Data(Payload),
    /// Ping, pong or raw frame.
    Control,
    /// Close frame.
    Closed,
}

/// Sort an incoming message.
pub fn classify(message: Message) -> Inbound {
    match message {
        Message::Text(text) => Inbound::Data(Payload::Text(text.as_str().to_owned())),
        Message::Binary(bytes) => Inbound::Data(Payload::Binary(bytes.to_vec())),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Inbound::Control,
        Message::Close(_) => Inbound::Closed,
    }
}

/// Encode a request frame into a socket message.
pub fn request_message(codec: Codec, request: &Request) -> Result<Message> {
    Ok(match codec.encode(request)? {
        Payload::Text(text) => Message::Text(text.into()),
        Payload::Binary(bytes) => Message::Binary(bytes.into()),
    })
}

fn handshake_failed(message: impl Into<String>) -> ChannelError {
    ChannelError::Handshake {
        status: None,
        message: message.into(),
    }
}

/// Map a dial failure. Upgrade rejections keep their HTTP status.
pub fn handshake_error(err: WsError) -> ChannelError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            ChannelError::Handshake {
                status: Some(status.as_u16()),
                message: format!("upgrade rejected with status {status}"),
            }
        }
        other => handshake_failed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn url_carries_id_secret_and_codec() {
        let address = Address::parse("ws://127.0.0.1:9000/rpc")
            .unwrap()
            .with_secret("s3cret")
            .with_codec(Codec::Clone);
        let url = handshake_url(&address, "c1").unwrap();
        assert_eq!(url.path(), "/rpc");
        assert_eq!(url.port(), Some(9000));
        assert_eq!(url.query(), Some("id=c1&secret=s3cret&codec=CLONE"));
    }

    #[test]
    fn unix_url_uses_placeholder_host() {
        let address = Address::parse("ws+unix:/tmp/modlink/a.sock").unwrap();
        let url = handshake_url(&address, "c1").unwrap();
        assert_eq!(url.as_str(), "ws://localhost/?id=c1&codec=JSON");
    }

    #[test]
    fn control_frames_have_no_payload() {
        assert_eq!(classify(Message::Ping(Vec::new().into())), Inbound::Control);
        assert_eq!(classify(Message::Close(None)), Inbound::Closed);
        assert_eq!(
            classify(Message::Text("[6,1]".into())),
            Inbound::Data(Payload::Text("[6,1]".into()))
        );
    }

    #[test]
    fn requests_encode_per_codec() {
        let request = Request::invoke(1, "math", "add", vec![json!(1), json!(2)]);
        assert!(matches!(request_message(Codec::Json, &request).unwrap(), Message::Text(_)));
        assert!(matches!(request_message(Codec::Clone, &request).unwrap(), Message::Binary(_)));
    }

    #[tokio::test]
    async fn greeting_must_be_connect() {
        let frames = vec![
            Ok(Message::Pong(Vec::new().into())),
            Ok(Message::Text(r#"[1,"ws://127.0.0.1:1/","CLONE"]"#.into())),
        ];
        let mut stream: FrameStream = futures::stream::iter(frames).boxed();
        let greeting = read_greeting(&mut stream, Codec::Json).await.unwrap();
        assert_eq!(greeting.server_id, "ws://127.0.0.1:1/");
        assert_eq!(greeting.codec, Codec::Clone);

        let frames = vec![Ok(Message::Text("[6,1]".into()))];
        let mut stream: FrameStream = futures::stream::iter(frames).boxed();
        let err = read_greeting(&mut stream, Codec::Json).await.unwrap_err();
        assert!(matches!(err, ChannelError::Handshake { status: None, .. }));
    }
}
