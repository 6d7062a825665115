//! PostgreSQL streaming replication client
//!
//! A raw TCP client speaking the replication sub-protocol: startup with
//! `replication=database`, cleartext/MD5/SCRAM-SHA-256 authentication,
//! slot creation, `START_REPLICATION` and standby status updates. TLS is
//! not supported.

use super::decoder::PgOutputDecoder;
use super::message::ReplicationFrame;
use super::scram::ScramSha256;
use crate::connection::ConnectionConfig;
use crate::error::{PgError, PgResult, ServerError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use postgres_protocol::message::frontend;
use std::io::Cursor;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, Chain};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Timeout for establishing the TCP connection
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest backend message accepted
const MAX_MESSAGE_SIZE: usize = 1 << 30;

/// Microseconds between the Unix epoch and 2000-01-01
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

const AUTH_OK: i32 = 0;
const AUTH_CLEARTEXT: i32 = 3;
const AUTH_MD5: i32 = 5;
const AUTH_SASL: i32 = 10;
const AUTH_SASL_CONTINUE: i32 = 11;
const AUTH_SASL_FINAL: i32 = 12;

/// Replication connection in command mode
pub struct ReplicationClient {
    stream: BufReader<TcpStream>,
    user: String,
    database: String,
}

impl ReplicationClient {
    /// Connect and authenticate in logical replication mode
    pub async fn connect(config: &ConnectionConfig) -> PgResult<Self> {
        let host = config.host();
        let port = config.port();
        let user = config.user();
        let database = config.database();
        info!(%host, port, %user, %database, "Opening replication connection");

        let stream = tokio::time::timeout(CONNECTION_TIMEOUT, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| PgError::Timeout(format!("connecting to {host}:{port}")))?
            .map_err(|e| PgError::Connection(format!("{host}:{port}: {e}")))?;
        stream.set_nodelay(true)?;

        let mut client = Self {
            stream: BufReader::new(stream),
            user,
            database,
        };

        let mut buf = BytesMut::new();
        let params = [
            ("user", client.user.as_str()),
            ("database", client.database.as_str()),
            ("replication", "database"),
            ("application_name", "electric"),
        ];
        frontend::startup_message(params.into_iter(), &mut buf)?;
        client.write(&buf).await?;

        client.authenticate(config.password().as_deref()).await?;
        client.wait_ready().await?;
        debug!("Replication connection ready");
        Ok(client)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    async fn authenticate(&mut self, password: Option<&str>) -> PgResult<()> {
        let mut scram: Option<ScramSha256> = None;

        loop {
            let (tag, mut body) = read_message(&mut self.stream).await?;
            match tag {
                b'R' => {}
                b'E' => return Err(PgError::Server(parse_error_response(&body))),
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message '{}' during authentication",
                        other as char
                    )))
                }
            }
            if body.remaining() < 4 {
                return Err(PgError::Protocol("short authentication message".into()));
            }

            match body.get_i32() {
                AUTH_OK => return Ok(()),
                AUTH_CLEARTEXT => {
                    warn!("Server requested a cleartext password");
                    let pass = require_password(password)?;
                    let mut buf = BytesMut::new();
                    frontend::password_message(pass.as_bytes(), &mut buf)?;
                    self.write(&buf).await?;
                }
                AUTH_MD5 => {
                    let pass = require_password(password)?;
                    if body.remaining() < 4 {
                        return Err(PgError::Protocol("missing MD5 salt".into()));
                    }
                    let hash = md5_password(&self.user, pass, &body[..4]);
                    let mut buf = BytesMut::new();
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                    self.write(&buf).await?;
                }
                AUTH_SASL => {
                    let pass = require_password(password)?;
                    let mechanisms = parse_mechanisms(&body);
                    if !mechanisms.iter().any(|m| m == ScramSha256::MECHANISM) {
                        return Err(PgError::Auth(format!(
                            "no supported SASL mechanism in {mechanisms:?}"
                        )));
                    }
                    // the server takes the user name from the startup message
                    let exchange = ScramSha256::new("", pass);
                    let mut buf = BytesMut::new();
                    frontend::sasl_initial_response(
                        ScramSha256::MECHANISM,
                        &exchange.client_first_message(),
                        &mut buf,
                    )?;
                    self.write(&buf).await?;
                    scram = Some(exchange);
                }
                AUTH_SASL_CONTINUE => {
                    let exchange = scram
                        .as_mut()
                        .ok_or_else(|| PgError::Protocol("SASL continue before start".into()))?;
                    let client_final = exchange.client_final_message(&body)?;
                    let mut buf = BytesMut::new();
                    frontend::sasl_response(&client_final, &mut buf)?;
                    self.write(&buf).await?;
                }
                AUTH_SASL_FINAL => {
                    let exchange = scram
                        .as_ref()
                        .ok_or_else(|| PgError::Protocol("SASL final before start".into()))?;
                    exchange.verify_server_final(&body)?;
                }
                other => {
                    return Err(PgError::Auth(format!(
                        "unsupported authentication method {other}"
                    )))
                }
            }
        }
    }

    async fn wait_ready(&mut self) -> PgResult<()> {
        loop {
            let (tag, body) = read_message(&mut self.stream).await?;
            match tag {
                b'Z' => return Ok(()),
                b'E' => return Err(PgError::Server(parse_error_response(&body))),
                // ParameterStatus, BackendKeyData, NoticeResponse
                _ => {}
            }
        }
    }

    /// Create a logical slot using `pgoutput`.
    ///
    /// Returns `false` when the slot already exists.
    pub async fn create_replication_slot(&mut self, slot_name: &str) -> PgResult<bool> {
        let query = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL pgoutput NOEXPORT_SNAPSHOT",
            quote_ident(slot_name)
        );
        match self.simple_query(&query).await {
            Ok(()) => {
                info!(slot = slot_name, "Created replication slot");
                Ok(true)
            }
            Err(e) if e.is_duplicate_object() => {
                debug!(slot = slot_name, "Replication slot already exists");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Switch to streaming; consumes the command-mode client
    pub async fn start_replication(
        mut self,
        slot_name: &str,
        start_lsn: u64,
        publication: &str,
    ) -> PgResult<ReplicationStream> {
        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            quote_ident(slot_name),
            crate::lsn::format_lsn(start_lsn),
            publication.replace('\'', "''")
        );
        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        self.write(&buf).await?;

        loop {
            let (tag, body) = read_message(&mut self.stream).await?;
            match tag {
                // CopyBothResponse
                b'W' => break,
                b'E' => return Err(PgError::Server(parse_error_response(&body))),
                b'N' => {}
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected response to START_REPLICATION: '{}'",
                        other as char
                    )))
                }
            }
        }

        info!(slot = slot_name, publication, "Replication streaming started");
        // frames may already sit in the read buffer
        let buffered = Bytes::copy_from_slice(self.stream.buffer());
        Ok(ReplicationStream::new(buffered, self.stream.into_inner()))
    }

    /// Run a command and wait for `ReadyForQuery`; the first error response
    /// is returned after the server is ready again
    async fn simple_query(&mut self, query: &str) -> PgResult<()> {
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)?;
        self.write(&buf).await?;

        let mut error = None;
        loop {
            let (tag, body) = read_message(&mut self.stream).await?;
            match tag {
                b'Z' => break,
                b'E' => {
                    error.get_or_insert_with(|| parse_error_response(&body));
                }
                _ => {}
            }
        }
        match error {
            Some(e) => Err(PgError::Server(e)),
            None => Ok(()),
        }
    }

    async fn write(&mut self, data: &[u8]) -> PgResult<()> {
        let stream = self.stream.get_mut();
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Replication connection in `CopyBoth` mode.
///
/// Frames are read by a background task so that [`next_frame`] is cancel
/// safe and can be used inside `select!`.
///
/// [`next_frame`]: ReplicationStream::next_frame
pub struct ReplicationStream {
    frames: mpsc::Receiver<PgResult<Option<Bytes>>>,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

impl ReplicationStream {
    fn new(buffered: Bytes, stream: TcpStream) -> Self {
        let (read_half, writer) = stream.into_split();
        let (tx, frames) = mpsc::channel(64);

        let reader = tokio::spawn(async move {
            let mut read_half = frame_reader(buffered, read_half);
            loop {
                let frame = read_copy_data(&mut read_half).await;
                let done = !matches!(frame, Ok(Some(_)));
                if tx.send(frame).await.is_err() || done {
                    break;
                }
            }
        });

        Self {
            frames,
            writer,
            reader,
        }
    }

    /// Next frame; `Ok(None)` when the server ended the stream
    pub async fn next_frame(&mut self) -> PgResult<Option<ReplicationFrame>> {
        match self.frames.recv().await {
            Some(Ok(Some(data))) => Ok(Some(PgOutputDecoder::decode_frame(data)?)),
            Some(Ok(None)) | None => Ok(None),
            Some(Err(e)) => Err(e),
        }
    }

    /// Report `lsn` as written, flushed and applied
    pub async fn send_status_update(&mut self, lsn: u64, reply_requested: bool) -> PgResult<()> {
        let payload = status_update(lsn, reply_requested, SystemTime::now());
        let mut frame = BytesMut::with_capacity(1 + 4 + payload.len());
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

impl Drop for ReplicationStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Standby status update payload (`r`)
fn status_update(lsn: u64, reply_requested: bool, now: SystemTime) -> Bytes {
    let micros = now
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64 - PG_EPOCH_OFFSET_MICROS)
        .unwrap_or(0);

    let mut payload = BytesMut::with_capacity(34);
    payload.put_u8(b'r');
    payload.put_u64(lsn);
    payload.put_u64(lsn);
    payload.put_u64(lsn);
    payload.put_i64(micros);
    payload.put_u8(u8::from(reply_requested));
    payload.freeze()
}

/// Bytes already buffered during startup are read before the socket
fn frame_reader<R: AsyncRead + Unpin>(buffered: Bytes, rest: R) -> BufReader<Chain<Cursor<Bytes>, R>> {
    BufReader::new(AsyncReadExt::chain(Cursor::new(buffered), rest))
}

/// Read the body of one `CopyData`; `None` on `CopyDone`
async fn read_copy_data<R: AsyncRead + Unpin>(stream: &mut R) -> PgResult<Option<Bytes>> {
    loop {
        let (tag, body) = read_message(stream).await?;
        match tag {
            b'd' => return Ok(Some(body)),
            b'c' => return Ok(None),
            b'E' => return Err(PgError::Server(parse_error_response(&body))),
            b'N' => debug!("Notice on replication stream"),
            other => {
                return Err(PgError::Protocol(format!(
                    "unexpected message '{}' on replication stream",
                    other as char
                )))
            }
        }
    }
}

async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> PgResult<(u8, Bytes)> {
    let tag = stream.read_u8().await?;
    let len = stream.read_i32().await?;
    if len < 4 || len as usize > MAX_MESSAGE_SIZE {
        return Err(PgError::Protocol(format!("invalid message length {len}")));
    }
    let mut body = vec![0u8; len as usize - 4];
    stream.read_exact(&mut body).await?;
    Ok((tag, Bytes::from(body)))
}

/// Fields of an `ErrorResponse` body: `(code, NUL-terminated string)*` then NUL
pub(crate) fn parse_error_response(body: &[u8]) -> ServerError {
    let mut error = ServerError::default();
    let mut rest = body;
    while let Some((&field, tail)) = rest.split_first() {
        if field == 0 {
            break;
        }
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        let value = String::from_utf8_lossy(&tail[..end]).into_owned();
        match field {
            b'S' => error.severity = value,
            b'C' => error.code = value,
            b'M' => error.message = value,
            _ => {}
        }
        rest = tail.get(end + 1..).unwrap_or_default();
    }
    error
}

fn parse_mechanisms(body: &[u8]) -> Vec<String> {
    body.split(|&b| b == 0)
        .take_while(|m| !m.is_empty())
        .map(|m| String::from_utf8_lossy(m).into_owned())
        .collect()
}

fn require_password(password: Option<&str>) -> PgResult<&str> {
    password.ok_or_else(|| PgError::Auth("password required but not provided".into()))
}

/// `md5` + hex(md5(hex(md5(password + user)) + salt))
fn md5_password(user: &str, pass: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(pass);
    hasher.update(user);
    let first = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(first);
    hasher.update(salt);
    format!("md5{}", hex::encode(hasher.finalize()))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
