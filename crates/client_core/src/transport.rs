use anyhow::{anyhow, Context, Result};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::{
    domain::UserId,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    net::TcpStream,
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) fn websocket_url(server_url: &str, user_id: UserId) -> Result<String> {
    let parsed =
        Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
    let ws_base = match parsed.scheme() {
        "http" => server_url.replacen("http://", "ws://", 1),
        "https" => server_url.replacen("https://", "wss://", 1),
        other => return Err(anyhow!("server url must be http(s), got {other}://")),
    };
    Ok(format!(
        "{}/ws?user_id={}",
        ws_base.trim_end_matches('/'),
        user_id.0
    ))
}

pub(crate) struct WsConnection {
    writer: SplitSink<WsStream, Message>,
    reader: SplitStream<WsStream>,
}

pub(crate) async fn connect(ws_url: &str) -> Result<WsConnection> {
    let (stream, _) = connect_async(ws_url)
        .await
        .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
    let (writer, reader) = stream.split();
    Ok(WsConnection { writer, reader })
}

impl WsConnection {
    /// Starts the two pump tasks: outbound requests are encoded and written
    /// as they arrive, inbound frames are decoded exactly once into
    /// `ServerEvent` and forwarded. Undecodable frames are logged and
    /// skipped; handlers downstream only ever pattern-match typed events.
    pub fn spawn(
        self,
        mut outbound: UnboundedReceiver<ClientRequest>,
        inbound: UnboundedSender<ServerEvent>,
    ) {
        let mut writer = self.writer;
        tokio::spawn(async move {
            while let Some(request) = outbound.recv().await {
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("failed to encode client request: {err}");
                        continue;
                    }
                };
                if writer.send(Message::Text(text)).await.is_err() {
                    debug!("websocket writer closed");
                    break;
                }
            }
        });

        let mut reader = self.reader;
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if inbound.send(event).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("undecodable server frame: {err}"),
                    },
                    Ok(Message::Close(_)) => {
                        debug!("websocket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("websocket read failed: {err}");
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_swaps_scheme_and_appends_user() {
        let url = websocket_url("http://127.0.0.1:4000", UserId(7)).expect("url");
        assert_eq!(url, "ws://127.0.0.1:4000/ws?user_id=7");

        let url = websocket_url("https://example.com/", UserId(8)).expect("url");
        assert_eq!(url, "wss://example.com/ws?user_id=8");
    }

    #[test]
    fn websocket_url_rejects_non_http_schemes() {
        assert!(websocket_url("ftp://example.com", UserId(1)).is_err());
        assert!(websocket_url("not a url", UserId(1)).is_err());
    }
}
