//! Blocking KATCP request/reply client.
//!
//! The client owns one TCP connection to the control server. Every
//! [`request`](Client::request) writes a `?name` line, then reads messages
//! until the matching `!name` reply arrives, collecting the request-scoped
//! `#name` informs along the way. Unrelated asynchronous informs
//! (`#log`, `#version-connect`, sensor chatter) are logged at trace level
//! and dropped.
//!
//! All calls block; reads are bounded by the configured timeout.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use tracing::{debug, trace};

use crate::message::{Message, MessageKind};
use crate::{KatcpError, KatcpResult};

/// TCP port tcpborphserver listens on.
pub const DEFAULT_PORT: u16 = 7147;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reply plus the informs that preceded it for one request.
#[derive(Debug)]
pub struct Response {
    pub reply: Message,
    pub informs: Vec<Message>,
}

/// A blocking KATCP connection.
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    timeout: Duration,
    next_id: u32,
}

impl Client {
    /// Connect to a control server, bounded by `timeout`.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> KatcpResult<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        debug!(%addr, "katcp connected");
        Ok(Client {
            reader: BufReader::new(stream),
            writer,
            timeout,
            next_id: 1,
        })
    }

    /// Adjust the per-request timeout (bitstream programming takes longer
    /// than register reads).
    pub fn set_timeout(&mut self, timeout: Duration) -> KatcpResult<()> {
        self.timeout = timeout;
        self.reader.get_ref().set_read_timeout(Some(timeout))?;
        self.writer.set_write_timeout(Some(timeout))?;
        Ok(())
    }

    /// Send a request and wait for its reply, requiring status `ok`.
    ///
    /// Returns the reply and any informs scoped to this request. A `fail` or
    /// `invalid` status becomes [`KatcpError::RequestFailed`].
    pub fn request(&mut self, name: &str, args: &[&[u8]]) -> KatcpResult<Response> {
        let mut msg = Message::request(name, args);
        msg.id = Some(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        trace!(name, id = ?msg.id, nargs = args.len(), "katcp request");
        self.writer.write_all(&msg.to_bytes())?;
        self.writer.flush()?;

        let mut informs = Vec::new();
        loop {
            let line = self.read_line(name)?;
            let incoming = Message::parse(&line)?;
            match incoming.kind {
                MessageKind::Inform if incoming.name == name => informs.push(incoming),
                MessageKind::Inform => {
                    trace!(name = %incoming.name, "unsolicited inform dropped");
                }
                MessageKind::Reply if incoming.name == name => {
                    let status = incoming.arg_str(0).unwrap_or_default();
                    if status != "ok" {
                        return Err(KatcpError::RequestFailed {
                            name: name.to_string(),
                            status,
                            message: incoming.arg_str(1).unwrap_or_default(),
                        });
                    }
                    trace!(name, ninforms = informs.len(), "katcp reply ok");
                    return Ok(Response {
                        reply: incoming,
                        informs,
                    });
                }
                MessageKind::Reply => {
                    return Err(KatcpError::Protocol(format!(
                        "reply !{} while waiting for !{}",
                        incoming.name, name
                    )));
                }
                MessageKind::Request => {
                    return Err(KatcpError::Protocol(
                        "server sent a request message".into(),
                    ));
                }
            }
        }
    }

    fn read_line(&mut self, pending: &str) -> KatcpResult<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let n = self
                .reader
                .read_until(b'\n', &mut line)
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                        KatcpError::Timeout(pending.to_string())
                    }
                    _ => KatcpError::Io(e),
                })?;
            if n == 0 {
                return Err(KatcpError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed connection",
                )));
            }
            // Servers may emit bare newlines between messages.
            if line.iter().all(|&b| b == b'\n' || b == b'\r') {
                line.clear();
                continue;
            }
            return Ok(line);
        }
    }
}
