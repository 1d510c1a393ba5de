use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{net_err, DaemonError, ProtocolError};
use crate::protocol::{
    AckJoinPayload, Frame, FrameReader, FrameWriter, JoinPayload, Message, MessageKind,
};

/// Deadline for AckJoin and ResponseFile replies.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Byte stream a session runs over: plain TCP or TLS.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Both directions of one connection.
pub struct Connection {
    pub reader: FrameReader<ReadHalf<BoxedTransport>>,
    pub writer: FrameWriter<WriteHalf<BoxedTransport>>,
}

impl Connection {
    pub fn new(stream: BoxedTransport) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
        }
    }

    /// Read one frame within [`REPLY_TIMEOUT`]; `what` names it in errors.
    pub async fn reply(&mut self, what: &'static str) -> Result<Frame, ProtocolError> {
        tokio::time::timeout(REPLY_TIMEOUT, self.reader.expect_frame())
            .await
            .map_err(|_| ProtocolError::Timeout(what))?
    }
}

/// Credentials a client presents in its Join.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Opens authenticated sessions to one server.
#[derive(Clone)]
pub struct Dialer {
    address: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    credentials: Option<Credentials>,
}

impl Dialer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tls: None,
            credentials: None,
        }
    }

    pub fn with_tls(mut self, connector: TlsConnector, server_name: ServerName<'static>) -> Self {
        self.tls = Some((connector, server_name));
        self
    }

    /// Join with these credentials on every session. Without them the Join
    /// exchange is skipped.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Dial and, if credentials are configured, complete the Join exchange.
    pub async fn open_session(&self) -> Result<Connection, DaemonError> {
        let mut conn = Connection::new(self.dial().await?);
        if let Some(credentials) = &self.credentials {
            join(&mut conn, credentials).await?;
        }
        Ok(conn)
    }

    async fn dial(&self) -> Result<BoxedTransport, DaemonError> {
        let tcp = TcpStream::connect(&self.address)
            .await
            .map_err(|e| net_err(&self.address, e))?;
        let _ = tcp.set_nodelay(true);

        match &self.tls {
            Some((connector, server_name)) => {
                let stream = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|e| DaemonError::Tls(format!("handshake with {}: {e}", self.address)))?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(tcp)),
        }
    }
}

async fn join(conn: &mut Connection, credentials: &Credentials) -> Result<(), DaemonError> {
    conn.writer
        .send(Message::Join(JoinPayload {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        }))
        .await?;

    let reply = conn.reply("AckJoin").await?;
    match reply.message {
        Message::AckJoin(AckJoinPayload { ok: true, .. }) => Ok(()),
        Message::AckJoin(AckJoinPayload { msg, .. }) => Err(DaemonError::Rejected(if msg.is_empty() {
            "authentication failed".to_string()
        } else {
            msg
        })),
        other => Err(ProtocolError::UnexpectedKind {
            expected: MessageKind::AckJoin,
            received: other.kind(),
        }
        .into()),
    }
}
