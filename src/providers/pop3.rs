use crate::config::AccountConfig;
use crate::logging::DEBUG;
use crate::providers::{Connector, Listing, Mailbox, MailboxStat, ProviderError};
use native_tls::{HandshakeError, TlsConnector, TlsStream};
use secrecy::{ExposeSecret, SecretString};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::debug;

/// Line-oriented POP3 client over any byte stream.
pub struct Pop3Client<S: Read + Write> {
    stream: BufReader<S>,
}

impl<S: Read + Write> Pop3Client<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.stream.get_mut()
    }

    /// Gives back the raw stream. Only call this when the server is waiting on
    /// us (after `STLS`), otherwise buffered input is lost.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    pub fn read_greeting(&mut self) -> Result<String, ProviderError> {
        self.read_status()
    }

    pub fn login(&mut self, username: &str, password: &SecretString) -> Result<(), ProviderError> {
        self.command(&format!("USER {username}"))
            .map_err(into_auth_error)?;
        self.command(&format!("PASS {}", password.expose_secret()))
            .map_err(into_auth_error)?;
        Ok(())
    }

    pub fn stls(&mut self) -> Result<(), ProviderError> {
        self.command("STLS").map(|_| ())
    }

    pub fn stat(&mut self) -> Result<MailboxStat, ProviderError> {
        let response = self.command("STAT")?;
        parse_stat(&response)
    }

    pub fn uidl(&mut self) -> Result<Vec<Listing>, ProviderError> {
        self.command("UIDL")?;
        let body = self.read_multiline()?;
        parse_uidl(&body)
    }

    pub fn retr(&mut self, position: usize) -> Result<Vec<u8>, ProviderError> {
        self.command(&format!("RETR {position}"))?;
        self.read_multiline()
    }

    pub fn dele(&mut self, position: usize) -> Result<(), ProviderError> {
        self.command(&format!("DELE {position}")).map(|_| ())
    }

    pub fn rset(&mut self) -> Result<(), ProviderError> {
        self.command("RSET").map(|_| ())
    }

    pub fn quit(mut self) -> Result<(), ProviderError> {
        self.command("QUIT").map(|_| ())
    }

    fn command(&mut self, line: &str) -> Result<String, ProviderError> {
        self.send(line)?;
        self.read_status()
    }

    fn send(&mut self, line: &str) -> Result<(), ProviderError> {
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\r\n")?;
        stream.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Vec<u8>, ProviderError> {
        let mut line = Vec::new();
        let read = self.stream.read_until(b'\n', &mut line)?;
        if read == 0 {
            return Err(ProviderError::Network("connection closed by server".into()));
        }
        Ok(line)
    }

    fn read_status(&mut self) -> Result<String, ProviderError> {
        let line = self.read_line()?;
        let text = String::from_utf8_lossy(&line).trim_end().to_string();
        if let Some(rest) = text.strip_prefix("+OK") {
            Ok(rest.trim().to_string())
        } else if let Some(rest) = text.strip_prefix("-ERR") {
            Err(ProviderError::Protocol(rest.trim().to_string()))
        } else {
            Err(ProviderError::Protocol(format!("unexpected response: {text}")))
        }
    }

    /// Reads a dot-terminated multi-line body, undoing byte-stuffing.
    fn read_multiline(&mut self) -> Result<Vec<u8>, ProviderError> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line()?;
            let content = line
                .strip_suffix(b"\r\n")
                .or_else(|| line.strip_suffix(b"\n"))
                .unwrap_or(&line);
            if content == b"." {
                break;
            }
            if line.starts_with(b".") {
                body.extend_from_slice(&line[1..]);
            } else {
                body.extend_from_slice(&line);
            }
        }
        Ok(body)
    }
}

fn into_auth_error(error: ProviderError) -> ProviderError {
    match error {
        ProviderError::Protocol(message) => ProviderError::Authentication(message),
        other => other,
    }
}

fn parse_stat(response: &str) -> Result<MailboxStat, ProviderError> {
    let mut parts = response.split_whitespace();
    let count = parts.next().and_then(|value| value.parse::<usize>().ok());
    let size = parts.next().and_then(|value| value.parse::<u64>().ok());
    match (count, size) {
        (Some(count), Some(size)) => Ok(MailboxStat { count, size }),
        _ => Err(ProviderError::Protocol(format!(
            "malformed STAT response: {response}"
        ))),
    }
}

fn parse_uidl(body: &[u8]) -> Result<Vec<Listing>, ProviderError> {
    let text = String::from_utf8_lossy(body);
    let mut listing = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let position = parts.next().and_then(|value| value.parse::<usize>().ok());
        let identifier = parts.next();
        match (position, identifier) {
            (Some(position), Some(identifier)) => listing.push(Listing::new(position, identifier)),
            _ => {
                return Err(ProviderError::Protocol(format!(
                    "malformed UIDL line: {line}"
                )))
            }
        }
    }
    Ok(listing)
}

/// Authenticated POP3 session for one account.
pub struct Pop3Session<S: Read + Write = TlsStream<DeadlineStream>> {
    client: Pop3Client<S>,
}

impl<S: Read + Write> Pop3Session<S> {
    pub fn new(client: Pop3Client<S>) -> Self {
        Self { client }
    }
}

impl<S: Read + Write> Mailbox for Pop3Session<S> {
    fn stat(&mut self) -> Result<MailboxStat, ProviderError> {
        self.client.stat()
    }

    fn list_identifiers(&mut self) -> Result<Vec<Listing>, ProviderError> {
        self.client.uidl()
    }

    fn retrieve(&mut self, position: usize) -> Result<Vec<u8>, ProviderError> {
        self.client.retr(position)
    }

    fn delete(&mut self, position: usize) -> Result<(), ProviderError> {
        self.client.dele(position)
    }

    fn reset(&mut self) -> Result<(), ProviderError> {
        self.client.rset()
    }

    fn close(self) -> Result<(), ProviderError> {
        self.client.quit()
    }
}

/// TCP stream that refuses to read or write past a deadline.
///
/// The socket timeout is re-armed with the time left before every call, so a
/// peer trickling bytes cannot stretch a connect attempt beyond its budget.
#[derive(Debug)]
pub struct DeadlineStream {
    inner: TcpStream,
    deadline: Option<Instant>,
}

impl DeadlineStream {
    fn new(inner: TcpStream, deadline: Instant) -> Self {
        Self {
            inner,
            deadline: Some(deadline),
        }
    }

    /// Drops the deadline once the session is established.
    fn clear_deadline(&mut self) -> io::Result<()> {
        self.deadline = None;
        self.inner.set_read_timeout(None)?;
        self.inner.set_write_timeout(None)
    }
}

impl Read for DeadlineStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(deadline) = self.deadline {
            self.inner.set_read_timeout(Some(time_left(deadline)?))?;
        }
        self.inner.read(buf)
    }
}

impl Write for DeadlineStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(deadline) = self.deadline {
            self.inner.set_write_timeout(Some(time_left(deadline)?))?;
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Opens POP3 sessions: implicit TLS first, then plaintext upgraded with `STLS`.
#[derive(Debug, Clone)]
pub struct Pop3Connector {
    connect_timeout: Duration,
    fallback_timeout: Duration,
}

impl Pop3Connector {
    pub fn new(connect_timeout: Duration, fallback_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            fallback_timeout,
        }
    }

    fn connect_secure(
        &self,
        account: &AccountConfig,
    ) -> Result<Pop3Client<TlsStream<DeadlineStream>>, ProviderError> {
        let deadline = Instant::now() + self.connect_timeout;
        let tcp = open_tcp(&account.server, account.pop3s_port, deadline)?;
        let tls = handshake(&account.server, DeadlineStream::new(tcp, deadline))?;
        let mut client = Pop3Client::new(tls);
        client.read_greeting()?;
        Ok(client)
    }

    fn connect_starttls(
        &self,
        account: &AccountConfig,
    ) -> Result<Pop3Client<TlsStream<DeadlineStream>>, ProviderError> {
        let deadline = Instant::now() + self.fallback_timeout;
        let tcp = open_tcp(&account.server, account.pop3_port, deadline)?;
        let mut plain = Pop3Client::new(DeadlineStream::new(tcp, deadline));
        plain.read_greeting()?;
        plain.stls()?;
        let tls = handshake(&account.server, plain.into_inner())?;
        Ok(Pop3Client::new(tls))
    }
}

impl Connector for Pop3Connector {
    type Session = Pop3Session;

    fn connect(&self, account: &AccountConfig) -> Result<Pop3Session, ProviderError> {
        let mut client = match self.connect_secure(account) {
            Ok(client) => client,
            Err(err) => {
                debug!(
                    target: DEBUG,
                    account = %account.address,
                    server = %account.server,
                    error = %err,
                    "implicit TLS failed, retrying with STLS upgrade"
                );
                self.connect_starttls(account)?
            }
        };

        client.login(&account.username, &account.password)?;

        client.get_mut().get_mut().clear_deadline()?;

        debug!(
            target: DEBUG,
            account = %account.address,
            server = %account.server,
            "pop3 session established"
        );
        Ok(Pop3Session::new(client))
    }
}

fn time_left(deadline: Instant) -> io::Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|budget| !budget.is_zero())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                "connection attempt exceeded its time budget",
            )
        })
}

fn open_tcp(host: &str, port: u16, deadline: Instant) -> Result<TcpStream, ProviderError> {
    let addrs = (host, port).to_socket_addrs()?;
    let mut last_error = None;
    for addr in addrs {
        let budget = time_left(deadline)?;
        match TcpStream::connect_timeout(&addr, budget) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_error = Some(err),
        }
    }
    Err(last_error
        .map(ProviderError::from)
        .unwrap_or_else(|| ProviderError::Network(format!("no addresses resolved for {host}:{port}"))))
}

fn handshake(
    host: &str,
    tcp: DeadlineStream,
) -> Result<TlsStream<DeadlineStream>, ProviderError> {
    let connector = TlsConnector::builder().build()?;
    connector.connect(host, tcp).map_err(|err| match err {
        HandshakeError::Failure(err) => ProviderError::from(err),
        HandshakeError::WouldBlock(_) => {
            ProviderError::Timeout(format!("TLS handshake with {host} did not complete"))
        }
    })
}
