//! Device-facing TCP server
//!
//! Each accepted connection runs in its own task: the read half frames and
//! decodes lines and hands them to the [`DeviceHandler`] in arrival order,
//! while a writer task drains the [`DeviceChannel`] queue. The handler hears
//! about the close exactly once, whichever side ends the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::codec::frame::FrameDecoder;
use crate::codec::{Codec, Message};
use crate::session::{ChannelCommand, DeviceChannel};

/// Receives decoded traffic from device connections
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    /// Codec used to decode inbound lines
    fn codec(&self) -> &Codec;

    /// A well-formed message arrived
    async fn on_message(&self, channel: &DeviceChannel, message: Message);

    /// The connection ended
    async fn on_channel_closed(&self, channel: &DeviceChannel);
}

/// TCP accept loop for device connections
pub struct DeviceServer {
    listener: TcpListener,
    handler: Arc<dyn DeviceHandler>,
    max_frame_len: usize,
}

impl DeviceServer {
    /// Bind the listening socket
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    pub async fn bind(
        addr: &str,
        handler: Arc<dyn DeviceHandler>,
        max_frame_len: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "device server listening");

        Ok(Self {
            listener,
            handler,
            max_frame_len,
        })
    }

    /// Address the server is bound to
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Currently infallible; accept errors are logged and the loop continues
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let handler = Arc::clone(&self.handler);
                    let max_frame_len = self.max_frame_len;
                    tokio::spawn(serve_connection(stream, peer.to_string(), handler, max_frame_len));
                }
                Err(e) => tracing::warn!(error = %e, "failed to accept device connection"),
            }
        }

        tracing::info!("device server stopped");
        Ok(())
    }
}

/// Drive one device connection to completion
pub async fn serve_connection<S>(
    stream: S,
    peer: String,
    handler: Arc<dyn DeviceHandler>,
    max_frame_len: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let framing = FrameDecoder::new(handler.codec().delimiters(), max_frame_len);
    let (mut sink, mut frames) = Framed::new(stream, framing).split();
    let (channel, mut commands) = DeviceChannel::new(peer);
    let done = CancellationToken::new();

    tracing::info!(channel = %channel.id(), peer = %channel.peer(), "device connected");

    let writer_done = done.clone();
    let writer_channel = channel.id();
    let writer = tokio::spawn(async move {
        loop {
            let command = tokio::select! {
                () = writer_done.cancelled() => break,
                command = commands.recv() => command,
            };
            match command {
                Some(ChannelCommand::Write(line)) => {
                    if let Err(e) = sink.send(line).await {
                        tracing::warn!(channel = %writer_channel, error = %e, "device write failed");
                        break;
                    }
                }
                Some(ChannelCommand::Close) | None => break,
            }
        }
        let _ = sink.close().await;
        writer_done.cancel();
    });

    loop {
        let frame = tokio::select! {
            () = done.cancelled() => break,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(line)) => match handler.codec().decode(&line) {
                Ok(message) => handler.on_message(&channel, message).await,
                Err(e) => {
                    tracing::warn!(channel = %channel.id(), error = %e, line = %line, "dropping malformed frame");
                }
            },
            Some(Err(e)) => {
                tracing::warn!(channel = %channel.id(), error = %e, "device read failed");
                break;
            }
            None => break,
        }
    }

    done.cancel();
    let _ = writer.await;

    tracing::info!(channel = %channel.id(), peer = %channel.peer(), "device disconnected");
    handler.on_channel_closed(&channel).await;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::codec::frame::DEFAULT_MAX_FRAME_LEN;

    /// Answers logins with success and closes on a location report
    struct Echo {
        codec: Codec,
        seen: Mutex<Vec<Message>>,
        closed: mpsc::UnboundedSender<String>,
    }

    impl Echo {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (closed, rx) = mpsc::unbounded_channel();
            let echo = Arc::new(Self {
                codec: Codec::default(),
                seen: Mutex::new(Vec::new()),
                closed,
            });
            (echo, rx)
        }
    }

    #[async_trait]
    impl DeviceHandler for Echo {
        fn codec(&self) -> &Codec {
            &self.codec
        }

        async fn on_message(&self, channel: &DeviceChannel, message: Message) {
            self.seen.lock().unwrap().push(message.clone());
            match message {
                Message::Login { header, .. } => {
                    let reply = Message::login_response(&header.device_id, &header.flow_no, 0);
                    channel.write(self.codec.encode(&reply)).unwrap();
                }
                Message::LocationReport { .. } => channel.close(),
                _ => {}
            }
        }

        async fn on_channel_closed(&self, channel: &DeviceChannel) {
            self.closed.send(channel.id().to_string()).unwrap();
        }
    }

    #[tokio::test]
    async fn mock_stream_login_round_trip() {
        let (echo, mut closed) = Echo::new();
        let stream = tokio_test::io::Builder::new()
            .read(b"garbage#dev1,1,DEVICE_LOGIN,0,secret123|")
            .write(b"#dev1,1,DEVICE_LOGIN,1,0|")
            .read(b"#dev1,2,BOGUS,0,x|")
            .build();

        serve_connection(stream, "mock".to_string(), echo.clone(), DEFAULT_MAX_FRAME_LEN).await;

        assert!(closed.recv().await.is_some());
        let seen = echo.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], Message::login("dev1", "1", "secret123"));
    }

    #[tokio::test]
    async fn tcp_server_reports_close_once() {
        let (echo, mut closed) = Echo::new();
        let server = DeviceServer::bind("127.0.0.1:0", echo.clone(), DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(server.run(shutdown.clone()));

        let mut device = TcpStream::connect(addr).await.unwrap();
        device
            .write_all(b"#dev1,1,DEVICE_LOGIN,0,secret123|")
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"#dev1,1,DEVICE_LOGIN,1,0|");

        // handler closes the channel on a location report
        device
            .write_all(b"#dev1,2,REPORT_LOCATION_INFO,0,12.34,56.78|")
            .await
            .unwrap();
        assert_eq!(device.read(&mut buf).await.unwrap(), 0);
        assert!(closed.recv().await.is_some());

        shutdown.cancel();
        running.await.unwrap().unwrap();
        assert!(closed.try_recv().is_err());
    }
}
