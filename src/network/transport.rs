// Framed message transport over a TCP connection

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use crate::core::PROTOCOL_VERSION;
use crate::error::{Error, Result};
use crate::network::{DecodeOptions, Message, MessageHeader, PeerConfig, VersionMessage};

/// A connection that has completed the version handshake and moves whole
/// messages. Reads happen only from a peer's run loop; writes may come from
/// any task.
pub trait Transport: Send + Sync + 'static {
    /// Next message from the remote side. Message-local errors
    /// (`MalformedEncoding`, `ProtocolViolation`) leave the stream usable;
    /// anything else means the connection is gone.
    fn read_message(&self) -> impl Future<Output = Result<Message>> + Send;

    fn write_message(&self, message: &Message) -> impl Future<Output = Result<()>> + Send;

    /// Close the connection. Safe to call more than once.
    fn shutdown(&self) -> impl Future<Output = ()> + Send;

    /// The version message the remote side sent during the handshake
    fn peer_version(&self) -> &VersionMessage;
}

/// [`Transport`] over TCP
pub struct TcpTransport {
    addr: SocketAddr,
    magic: [u8; 4],
    options: DecodeOptions,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    // set once by shutdown; aborts writes stuck on a remote that stopped reading
    closed: watch::Sender<bool>,
    peer_version: VersionMessage,
}

impl TcpTransport {
    /// Connect and run the version/verack handshake, all within the
    /// configured timeout. Any failure is `PeerUnavailable`.
    pub async fn connect(addr: SocketAddr, config: &PeerConfig) -> Result<Self> {
        let handshake = Self::connect_and_handshake(addr, config);
        match tokio::time::timeout(config.connect_timeout, handshake).await {
            Ok(Ok(transport)) => Ok(transport),
            Ok(Err(e)) => Err(Error::PeerUnavailable(format!("{}: {}", addr, e))),
            Err(_) => Err(Error::PeerUnavailable(format!(
                "{}: no handshake within {:?}",
                addr, config.connect_timeout
            ))),
        }
    }

    async fn connect_and_handshake(addr: SocketAddr, config: &PeerConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(connection_error)?;
        stream.set_nodelay(true).map_err(connection_error)?;
        debug!("Connected to {}", addr);

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let magic = config.params.magic;
        let mut options = DecodeOptions {
            parse_lazy: config.parse_lazy,
            protocol_version: PROTOCOL_VERSION,
        };

        let mut ours = VersionMessage::new(addr, &config.user_agent, config.best_height);
        if config.mobile_optimized {
            ours.relay = Some(false);
        }
        write_frame(&mut write_half, magic, &Message::Version(ours)).await?;

        let peer_version = match read_frame(&mut reader, magic, &options).await? {
            Message::Version(version) => version,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "expected version, got {}",
                    other.command()
                )));
            }
        };
        options.protocol_version = peer_version.version.min(PROTOCOL_VERSION);

        write_frame(&mut write_half, magic, &Message::Verack).await?;
        loop {
            match read_frame(&mut reader, magic, &options).await? {
                Message::Verack => break,
                other => debug!("Ignoring {} before verack", other.command()),
            }
        }

        info!(
            "Connected to {} running {} at height {}",
            addr, peer_version.user_agent, peer_version.start_height
        );
        Ok(Self {
            addr,
            magic,
            options,
            reader: Mutex::new(reader),
            writer: Mutex::new(write_half),
            closed: watch::Sender::new(false),
            peer_version,
        })
    }
}

impl Transport for TcpTransport {
    async fn read_message(&self) -> Result<Message> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader, self.magic, &self.options).await
    }

    async fn write_message(&self, message: &Message) -> Result<()> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(Error::PeerDisconnected(format!("connection to {} is closed", self.addr)));
        }

        let write = async {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, self.magic, message).await
        };
        let aborted = async { closed.wait_for(|closed| *closed).await.is_ok() };
        tokio::select! {
            result = write => result,
            _ = aborted => {
                Err(Error::PeerDisconnected(format!("connection to {} closed while sending {}", self.addr, message.command())))
            }
        }
    }

    async fn shutdown(&self) {
        // wakes any write in progress, which then drops the writer lock
        self.closed.send_replace(true);
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Shutting down connection to {}: {}", self.addr, e);
        }
    }

    fn peer_version(&self) -> &VersionMessage {
        &self.peer_version
    }
}

fn connection_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::PeerDisconnected("connection closed by peer".to_string())
    } else {
        Error::PeerDisconnected(e.to_string())
    }
}

/// Skip bytes until the network magic has been read
async fn seek_magic<R: AsyncRead + Unpin>(reader: &mut R, magic: [u8; 4]) -> Result<()> {
    let mut window = [0u8; 4];
    reader.read_exact(&mut window).await.map_err(connection_error)?;

    let mut skipped = 0usize;
    while window != magic {
        window.rotate_left(1);
        window[3] = reader.read_u8().await.map_err(connection_error)?;
        skipped += 1;
    }
    if skipped > 0 {
        debug!("Skipped {} bytes looking for network magic", skipped);
    }
    Ok(())
}

/// Read one frame and decode its payload
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    magic: [u8; 4],
    options: &DecodeOptions,
) -> Result<Message> {
    seek_magic(reader, magic).await?;

    let mut header_bytes = [0u8; MessageHeader::SIZE];
    header_bytes[..4].copy_from_slice(&magic);
    reader
        .read_exact(&mut header_bytes[4..])
        .await
        .map_err(connection_error)?;
    let header = MessageHeader::decode(&header_bytes, magic)?;

    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload).await.map_err(connection_error)?;
    header.verify(&payload)?;

    debug!("Received {} ({} bytes)", header.command, header.length);
    Message::decode_payload(&header.command, &payload, options)
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, magic: [u8; 4], message: &Message) -> Result<()> {
    let frame = message.to_frame(magic);
    writer.write_all(&frame).await.map_err(connection_error)?;
    writer.flush().await.map_err(connection_error)?;
    debug!("Sent {}", message);
    Ok(())
}
