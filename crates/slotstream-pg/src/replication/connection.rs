//! Streaming session over the PostgreSQL wire protocol.
//!
//! Connects in replication mode, authenticates, and carries the CopyBoth
//! exchange started by `START_REPLICATION`. Only the simple query protocol is
//! used, which is all a replication-mode backend accepts.

use std::future::Future;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use postgres_protocol::authentication::{self, sasl};
use postgres_protocol::message::{backend, frontend};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::params::ConnectionParams;
use super::protocol::{ReplicationMessage, StandbyStatus};
use super::transport::{ReplicationTransport, StartReplication};
use crate::error::{PgError, PgResult};
use crate::version::ServerVersion;

/// The `replication` startup parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplicationMode {
    /// `replication=database`: logical decoding from one database.
    #[default]
    Logical,
    /// `replication=true`: physical WAL streaming.
    Physical,
}

impl ReplicationMode {
    pub fn startup_value(self) -> &'static str {
        match self {
            ReplicationMode::Logical => "database",
            ReplicationMode::Physical => "true",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Streaming,
    Closed,
}

/// A replication-mode connection.
pub struct ReplicationConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    server_version: Option<ServerVersion>,
    phase: Phase,
}

impl ReplicationConnection {
    /// Connect, authenticate, and wait until the server is ready for commands.
    pub async fn connect(
        params: &ConnectionParams,
        mode: ReplicationMode,
        application_name: &str,
    ) -> PgResult<Self> {
        info!(
            host = %params.host,
            port = params.port,
            user = %params.user,
            database = %params.database,
            replication = mode.startup_value(),
            "Opening replication connection"
        );

        let stream = TcpStream::connect((params.host.as_str(), params.port))
            .await
            .map_err(|e| {
                PgError::Connection(format!("{}:{}: {}", params.host, params.port, e))
            })?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            read_buf: BytesMut::with_capacity(8 * 1024),
            server_version: None,
            phase: Phase::Idle,
        };

        let startup = [
            ("user", params.user.as_str()),
            ("database", params.database.as_str()),
            ("replication", mode.startup_value()),
            ("application_name", application_name),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(startup, &mut buf)?;
        conn.write(&buf).await?;

        conn.authenticate(params).await?;
        conn.wait_ready().await?;

        debug!(server_version = ?conn.server_version, "Replication connection ready");
        Ok(conn)
    }

    /// Version reported by the server at startup.
    pub fn server_version(&self) -> Option<ServerVersion> {
        self.server_version
    }

    pub fn is_streaming(&self) -> bool {
        self.phase == Phase::Streaming
    }

    async fn authenticate(&mut self, params: &ConnectionParams) -> PgResult<()> {
        let mut scram: Option<sasl::ScramSha256> = None;

        loop {
            let (tag, body) = self.read_frame().await?;
            match tag {
                b'R' => {}
                b'E' => return Err(server_error(&body)),
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message during authentication: {:?}",
                        other as char
                    )))
                }
            }

            let mut raw = BytesMut::with_capacity(5 + body.len());
            raw.put_u8(tag);
            raw.put_i32(body.len() as i32 + 4);
            raw.put_slice(&body);

            let message = backend::Message::parse(&mut raw)?
                .ok_or_else(|| PgError::Protocol("incomplete authentication message".into()))?;

            let mut buf = BytesMut::new();
            match message {
                backend::Message::AuthenticationOk => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                backend::Message::AuthenticationCleartextPassword => {
                    let password = password(params)?;
                    frontend::password_message(password.as_bytes(), &mut buf)?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let password = password(params)?;
                    let hash = authentication::md5_hash(
                        params.user.as_bytes(),
                        password.as_bytes(),
                        body.salt(),
                    );
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                }
                backend::Message::AuthenticationSasl(_) => {
                    // Without TLS the server only offers SCRAM-SHA-256, never the -PLUS variant.
                    let password = password(params)?;
                    let client = sasl::ScramSha256::new(
                        password.as_bytes(),
                        sasl::ChannelBinding::unsupported(),
                    );
                    frontend::sasl_initial_response(sasl::SCRAM_SHA_256, client.message(), &mut buf)?;
                    scram = Some(client);
                }
                backend::Message::AuthenticationSaslContinue(body) => {
                    let client = scram
                        .as_mut()
                        .ok_or_else(|| PgError::Protocol("SASL continue before SASL start".into()))?;
                    client.update(body.data())?;
                    frontend::sasl_response(client.message(), &mut buf)?;
                }
                backend::Message::AuthenticationSaslFinal(body) => {
                    let client = scram
                        .as_mut()
                        .ok_or_else(|| PgError::Protocol("SASL final before SASL start".into()))?;
                    client.finish(body.data())?;
                    continue;
                }
                _ => {
                    return Err(PgError::Connection(
                        "unsupported authentication method requested by server".into(),
                    ))
                }
            }

            self.write(&buf).await?;
        }
    }

    async fn wait_ready(&mut self) -> PgResult<()> {
        loop {
            let (tag, body) = self.read_frame().await?;
            match tag {
                b'Z' => return Ok(()),
                b'S' => self.parameter_status(&body),
                b'K' => {}
                b'N' => log_notice(&body),
                b'E' => return Err(server_error(&body)),
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message during startup: {:?}",
                        other as char
                    )))
                }
            }
        }
    }

    fn parameter_status(&mut self, body: &Bytes) {
        let mut fields = body.split(|b| *b == 0);
        let name = fields.next().map(String::from_utf8_lossy);
        let value = fields.next().map(String::from_utf8_lossy);

        if let (Some(name), Some(value)) = (name, value) {
            if name == "server_version" {
                self.server_version = ServerVersion::parse(&value);
            }
        }
    }

    /// Send CopyDone and Terminate, then close the socket.
    pub async fn close(&mut self) -> PgResult<()> {
        if self.phase == Phase::Closed {
            return Ok(());
        }

        let mut buf = BytesMut::new();
        if self.phase == Phase::Streaming {
            frontend::copy_done(&mut buf);
        }
        frontend::terminate(&mut buf);
        self.phase = Phase::Closed;

        self.write(&buf).await?;
        self.stream.shutdown().await?;
        info!("Replication connection closed");
        Ok(())
    }

    async fn write(&mut self, buf: &[u8]) -> PgResult<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Split a complete message off the read buffer, if one is there.
    fn take_frame(&mut self) -> PgResult<Option<(u8, Bytes)>> {
        if self.read_buf.len() < 5 {
            return Ok(None);
        }

        let tag = self.read_buf[0];
        let len = i32::from_be_bytes([
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
            self.read_buf[4],
        ]);
        if len < 4 {
            return Err(PgError::Protocol(format!("invalid message length: {}", len)));
        }

        let total = 1 + len as usize;
        if self.read_buf.len() < total {
            self.read_buf.reserve(total - self.read_buf.len());
            return Ok(None);
        }

        let mut frame = self.read_buf.split_to(total);
        frame.advance(5);
        Ok(Some((tag, frame.freeze())))
    }

    // Cancel-safe: bytes land in `read_buf` before any await can be dropped.
    async fn read_frame(&mut self) -> PgResult<(u8, Bytes)> {
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(frame);
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                self.phase = Phase::Closed;
                return Err(PgError::Connection("server closed the connection".into()));
            }
        }
    }

    fn stream_message(&mut self, tag: u8, body: Bytes) -> PgResult<Option<ReplicationMessage>> {
        match tag {
            b'd' => ReplicationMessage::decode(body).map(Some),
            b'c' => {
                debug!("Server ended the copy stream");
                self.phase = Phase::Idle;
                Err(PgError::StreamClosed)
            }
            b'E' => Err(server_error(&body)),
            b'N' => {
                log_notice(&body);
                Ok(None)
            }
            b'S' => {
                self.parameter_status(&body);
                Ok(None)
            }
            other => Err(PgError::Protocol(format!(
                "unexpected message while streaming: {:?}",
                other as char
            ))),
        }
    }

    fn ensure_streaming(&self) -> PgResult<()> {
        match self.phase {
            Phase::Streaming => Ok(()),
            Phase::Idle => Err(PgError::Protocol("replication stream not started".into())),
            Phase::Closed => Err(PgError::Connection("replication connection closed".into())),
        }
    }
}

impl ReplicationTransport for ReplicationConnection {
    fn start_logical(
        &mut self,
        request: &StartReplication,
    ) -> impl Future<Output = PgResult<()>> + Send {
        async move {
            let command = request.to_command();
            info!(slot = %request.slot, lsn = %request.start, "Starting logical replication");
            debug!(command = %command, "Sending replication command");

            let mut buf = BytesMut::new();
            frontend::query(&command, &mut buf)?;
            self.write(&buf).await?;

            loop {
                let (tag, body) = self.read_frame().await?;
                match tag {
                    b'W' => {
                        self.phase = Phase::Streaming;
                        info!("Entered CopyBoth mode");
                        return Ok(());
                    }
                    b'N' => log_notice(&body),
                    b'S' => self.parameter_status(&body),
                    b'E' => return Err(server_error(&body)),
                    other => {
                        return Err(PgError::Protocol(format!(
                            "unexpected response to START_REPLICATION: {:?}",
                            other as char
                        )))
                    }
                }
            }
        }
    }

    fn recv(&mut self) -> impl Future<Output = PgResult<ReplicationMessage>> + Send {
        async move {
            self.ensure_streaming()?;
            loop {
                let (tag, body) = self.read_frame().await?;
                if let Some(message) = self.stream_message(tag, body)? {
                    return Ok(message);
                }
            }
        }
    }

    fn try_recv(&mut self) -> PgResult<Option<ReplicationMessage>> {
        self.ensure_streaming()?;
        loop {
            if let Some((tag, body)) = self.take_frame()? {
                match self.stream_message(tag, body)? {
                    Some(message) => return Ok(Some(message)),
                    None => continue,
                }
            }

            match self.stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => {
                    self.phase = Phase::Closed;
                    return Err(PgError::Connection("server closed the connection".into()));
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn send_status(&mut self, status: StandbyStatus) -> impl Future<Output = PgResult<()>> + Send {
        async move {
            self.ensure_streaming()?;
            let payload = status.encode();

            let mut frame = BytesMut::with_capacity(5 + payload.len());
            frame.put_u8(b'd');
            frame.put_i32(payload.len() as i32 + 4);
            frame.put_slice(&payload);

            self.write(&frame).await?;
            debug!(
                write = %status.written,
                flush = %status.flushed,
                apply = %status.applied,
                "Sent standby status update"
            );
            Ok(())
        }
    }
}

fn password(params: &ConnectionParams) -> PgResult<&str> {
    params
        .password
        .as_deref()
        .ok_or_else(|| PgError::Connection("password required but not provided".into()))
}

/// Fields of an ErrorResponse or NoticeResponse body.
#[derive(Debug, Default, PartialEq, Eq)]
struct ServerNotice {
    severity: String,
    code: String,
    message: String,
}

fn parse_notice(body: &[u8]) -> ServerNotice {
    let mut notice = ServerNotice::default();
    let mut rest = body;

    while let Some((&field, tail)) = rest.split_first() {
        if field == 0 {
            break;
        }
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        let value = String::from_utf8_lossy(&tail[..end]).into_owned();

        match field {
            // 'V' is the untranslated severity; prefer it when present.
            b'V' => notice.severity = value,
            b'S' if notice.severity.is_empty() => notice.severity = value,
            b'C' => notice.code = value,
            b'M' => notice.message = value,
            _ => {}
        }

        rest = tail.get(end + 1..).unwrap_or_default();
    }

    notice
}

fn server_error(body: &[u8]) -> PgError {
    let notice = parse_notice(body);
    PgError::Server {
        severity: notice.severity,
        code: notice.code,
        message: notice.message,
    }
}

fn log_notice(body: &[u8]) {
    let notice = parse_notice(body);
    warn!(severity = %notice.severity, code = %notice.code, "{}", notice.message);
}
