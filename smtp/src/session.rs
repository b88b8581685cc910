use std::{collections::BTreeSet, mem::take, sync::Arc};

use anyhow::Result;
use mailveil_utils::{decode_plain, decode_sasl, CredentialStore, IncomingMessage};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, info, warn};

/// Largest message accepted by `DATA`, advertised through `SIZE`.
pub const MAX_MESSAGE_SIZE: usize = 25 * 1024 * 1024;

/// Base64 of `Username:` and `Password:`.
const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

/// How a command loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The client quit or the connection was closed.
    Closed,
    /// The client asked for STARTTLS and was told to proceed.
    StartTls,
}

/// State of a single SMTP connection.
#[derive(Debug)]
pub struct SmtpSession {
    hostname: String,
    peer: String,
    from: Option<String>,
    rcpts: BTreeSet<String>,
    authenticated: bool,
    auth_required: bool,
    tls_available: bool,
    tls_active: bool,
    credentials: Arc<CredentialStore>,
}

impl SmtpSession {
    pub fn new(
        hostname: String,
        peer: String,
        credentials: Arc<CredentialStore>,
        auth_required: bool,
        tls_available: bool,
    ) -> Self {
        Self {
            hostname,
            peer,
            from: None,
            rcpts: BTreeSet::new(),
            authenticated: false,
            auth_required,
            tls_available,
            tls_active: false,
            credentials,
        }
    }

    pub async fn greet<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let banner = format!("{} Mailveil ESMTP", self.hostname);
        self.write_response(writer, 220, &banner).await
    }

    /// Marks the connection as upgraded, any earlier state is discarded.
    pub fn start_tls(&mut self) {
        self.tls_active = true;
        self.authenticated = false;
        self.reset();
    }

    /// Reads and answers commands until the client quits, disconnects or
    /// asks for STARTTLS.
    pub async fn run<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        tx: &mpsc::Sender<IncomingMessage>,
    ) -> Result<Flow> {
        let mut line = String::with_capacity(1024);
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                debug!(peer = %self.peer, "Connection closed by client");
                return Ok(Flow::Closed);
            }
            let (command, argument) = split_command(&line);
            if command == "AUTH" {
                debug!(peer = %self.peer, tls = self.tls_active, "<< AUTH ***");
            } else {
                debug!(peer = %self.peer, tls = self.tls_active, "<< {}", line.trim_end());
            }

            match command.as_str() {
                "EHLO" => self.handle_ehlo(writer, argument).await?,
                "HELO" => self.handle_helo(writer, argument).await?,
                "STARTTLS" => {
                    if self.handle_starttls(writer).await? {
                        return Ok(Flow::StartTls);
                    }
                }
                "AUTH" => self.handle_auth(reader, writer, argument).await?,
                "MAIL" => self.handle_mail(writer, argument).await?,
                "RCPT" => self.handle_rcpt(writer, argument).await?,
                "DATA" => self.handle_data(reader, writer, tx).await?,
                "RSET" => {
                    self.reset();
                    self.write_response(writer, 250, "OK").await?;
                }
                "NOOP" => self.write_response(writer, 250, "OK").await?,
                "QUIT" => {
                    self.write_response(writer, 221, "Bye").await?;
                    return Ok(Flow::Closed);
                }
                _ => {
                    self.write_response(writer, 502, "Command not implemented")
                        .await?
                }
            }
        }
    }

    fn reset(&mut self) {
        self.from = None;
        self.rcpts.clear();
    }

    async fn handle_ehlo<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, client: &str) -> Result<()> {
        self.reset();
        let greeting = format!("{} greets {}", self.hostname, client);
        let size = format!("SIZE {MAX_MESSAGE_SIZE}");
        let mut lines = vec![greeting.as_str(), "8BITMIME", size.as_str()];
        if self.tls_available && !self.tls_active {
            lines.push("STARTTLS");
        }
        lines.push("AUTH LOGIN PLAIN");
        self.write_multiple(writer, 250, &lines).await
    }

    async fn handle_helo<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, client: &str) -> Result<()> {
        self.reset();
        let greeting = format!("{} greets {}", self.hostname, client);
        self.write_response(writer, 250, &greeting).await
    }

    /// Returns whether the caller should now perform the TLS handshake.
    async fn handle_starttls<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> Result<bool> {
        if self.tls_active {
            self.write_response(writer, 503, "TLS already active").await?;
            return Ok(false);
        }
        if !self.tls_available {
            self.write_response(writer, 502, "STARTTLS not available")
                .await?;
            return Ok(false);
        }
        self.write_response(writer, 220, "Ready to start TLS").await?;
        Ok(true)
    }

    async fn handle_auth<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        argument: &str,
    ) -> Result<()> {
        if self.authenticated {
            return self
                .write_response(writer, 503, "Already authenticated")
                .await;
        }

        let mut parts = argument.split_whitespace();
        let mechanism = parts.next().unwrap_or_default().to_ascii_uppercase();
        let initial = parts.next();

        let credentials = match mechanism.as_str() {
            "LOGIN" => {
                let username = match initial {
                    Some(value) => value.to_string(),
                    None => self.challenge(reader, writer, USERNAME_PROMPT).await?,
                };
                let password = self.challenge(reader, writer, PASSWORD_PROMPT).await?;
                decode_sasl(&username)
                    .and_then(|username| Ok((username, decode_sasl(&password)?)))
            }
            "PLAIN" => {
                let response = match initial {
                    Some(value) => value.to_string(),
                    None => self.challenge(reader, writer, "").await?,
                };
                decode_plain(&response)
            }
            _ => {
                return self
                    .write_response(writer, 504, "Unrecognized authentication type")
                    .await
            }
        };

        match credentials {
            Ok((username, password)) if self.credentials.authenticate(&username, &password) => {
                info!(peer = %self.peer, username = %username, "Client authenticated");
                self.authenticated = true;
                self.write_response(writer, 235, "Authentication successful")
                    .await
            }
            Ok((username, _)) => {
                warn!(peer = %self.peer, username = %username, "Authentication failed");
                self.write_response(writer, 535, "Authentication failed")
                    .await
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Malformed authentication exchange");
                self.write_response(writer, 501, "Malformed authentication response")
                    .await
            }
        }
    }

    async fn challenge<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &self,
        reader: &mut R,
        writer: &mut W,
        prompt: &str,
    ) -> Result<String> {
        self.write_response(writer, 334, prompt).await?;
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        Ok(line.trim().to_string())
    }

    fn auth_missing(&self) -> bool {
        self.auth_required && !self.authenticated
    }

    async fn handle_mail<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, argument: &str) -> Result<()> {
        if self.auth_missing() {
            return self
                .write_response(writer, 530, "Authentication required")
                .await;
        }
        if self.from.is_some() {
            return self
                .write_response(writer, 503, "Sender already specified")
                .await;
        }
        match parse_path(argument, "FROM:") {
            Some(from) => {
                self.from = Some(from);
                self.write_response(writer, 250, "OK").await
            }
            None => {
                self.write_response(writer, 501, "Syntax error in parameters or arguments")
                    .await
            }
        }
    }

    async fn handle_rcpt<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, argument: &str) -> Result<()> {
        if self.auth_missing() {
            return self
                .write_response(writer, 530, "Authentication required")
                .await;
        }
        if self.from.is_none() {
            return self
                .write_response(writer, 503, "Need MAIL command first")
                .await;
        }
        match parse_path(argument, "TO:").filter(|rcpt| !rcpt.is_empty()) {
            Some(rcpt) => {
                self.rcpts.insert(rcpt);
                self.write_response(writer, 250, "OK").await
            }
            None => {
                self.write_response(writer, 501, "Syntax error in parameters or arguments")
                    .await
            }
        }
    }

    async fn handle_data<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        tx: &mpsc::Sender<IncomingMessage>,
    ) -> Result<()> {
        if self.auth_missing() {
            return self
                .write_response(writer, 530, "Authentication required")
                .await;
        }
        if self.rcpts.is_empty() {
            return self
                .write_response(writer, 554, "No valid recipients")
                .await;
        }

        self.write_response(writer, 354, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let mut data = Vec::new();
        let mut line = Vec::with_capacity(1024);
        let mut oversized = false;
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                anyhow::bail!("Connection closed during DATA");
            }
            if line == b".\r\n" || line == b".\n" {
                break;
            }
            if oversized {
                continue;
            }
            // dot-stuffing
            let content = line.strip_prefix(b".").unwrap_or(&line[..]);
            data.extend_from_slice(content);
            if data.len() > MAX_MESSAGE_SIZE {
                oversized = true;
                data.clear();
            }
        }

        let from = self.from.take().unwrap_or_default();
        let rcpts = take(&mut self.rcpts);
        if oversized {
            warn!(peer = %self.peer, from = %from, "Message exceeds size limit, rejected");
            return self
                .write_response(writer, 552, "Message size exceeds fixed limit")
                .await;
        }

        info!(
            peer = %self.peer,
            from = %from,
            recipients = rcpts.len(),
            size = data.len(),
            "Message accepted"
        );
        let incoming = IncomingMessage {
            from,
            rcpts,
            raw: data,
        };
        if tx.send(incoming).await.is_err() {
            return self
                .write_response(writer, 451, "Delivery queue unavailable")
                .await;
        }
        self.write_response(writer, 250, "Message accepted").await
    }

    async fn write_inner<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
        separator: &str,
    ) -> Result<()> {
        debug!(peer = %self.peer, tls = self.tls_active, ">> {code}{separator}{message}");
        writer
            .write_all(format!("{code}{separator}{message}\r\n").as_bytes())
            .await?;
        Ok(())
    }

    async fn write_response<W: AsyncWrite + Unpin>(&self, writer: &mut W, code: u16, message: &str) -> Result<()> {
        self.write_inner(writer, code, message, " ").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn write_multiple<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        messages: &[&str],
    ) -> Result<()> {
        for (index, message) in messages.iter().enumerate() {
            let separator = if index == messages.len() - 1 { " " } else { "-" };
            self.write_inner(writer, code, message, separator).await?;
        }
        writer.flush().await?;
        Ok(())
    }
}

/// Splits a command line into the upper-cased verb and its argument.
fn split_command(line: &str) -> (String, &str) {
    let line = line.trim();
    match line.split_once(char::is_whitespace) {
        Some((command, argument)) => (command.to_ascii_uppercase(), argument.trim()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

/// Extracts the address from `FROM:<addr> ...` or `TO:<addr> ...`, the
/// null path `<>` yields an empty address.
fn parse_path(argument: &str, prefix: &str) -> Option<String> {
    let head = argument.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let path = argument[prefix.len()..].trim_start();
    let address = match path.strip_prefix('<') {
        Some(rest) => rest.split_once('>')?.0,
        None => path.split_whitespace().next()?,
    };
    Some(address.trim().to_string())
}
