//! Core message types used throughout the outbound pipeline.
//!
//! This module defines [`OutboundMessage`], the mutable unit the
//! encryption pipeline transforms, holding the subject, body, ordered
//! headers and content type of a single-recipient email. It also defines
//! [`IncomingMessage`], the SMTP envelope wrapper received before the
//! per-recipient split.
//!
//! Messages parsed from the wire remember the exact bytes they arrived
//! with, so a message no transformer changed is delivered byte-identical.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::{media_type, parse_raw_headers, HeaderMap};

/// Content type assumed when a message carries no `Content-Type` header.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// An outbound email addressed to a single recipient.
///
/// The subject is held apart from the other headers so the pipeline can
/// rewrite it independently. The `content_type` field holds the bare media
/// type, the complete `Content-Type` value (parameters included) lives in
/// [`headers`](Self::headers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Unique message identifier, without angle brackets.
    pub message_id: String,

    /// Envelope sender address.
    pub from: String,

    /// Envelope recipient address.
    pub to: String,

    /// Message subject, empty when absent.
    pub subject: String,

    /// Message body after the header section.
    pub body: Vec<u8>,

    /// Ordered header mapping, `Subject` excluded.
    pub headers: HeaderMap,

    /// Media type of the body (e.g. `text/plain`).
    pub content_type: String,

    received: Option<Received>,
}

/// A message exactly as submitted, with the fields parsed from it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Received {
    raw: Vec<u8>,
    body_offset: usize,
    subject: String,
    headers: HeaderMap,
}

impl OutboundMessage {
    /// Creates a message from its parts, deriving the content type from
    /// the headers when a `Content-Type` header is present.
    pub fn new(
        from: String,
        to: String,
        subject: String,
        body: Vec<u8>,
        headers: HeaderMap,
    ) -> Self {
        let content_type = headers
            .get("Content-Type")
            .map(media_type)
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        Self {
            message_id: Uuid::new_v4().to_string(),
            from,
            to,
            subject,
            body,
            headers,
            content_type,
            received: None,
        }
    }

    /// Parses a raw RFC 5322 message (headers, blank line, body).
    ///
    /// The body bytes are kept as received, only the header section is
    /// decoded as text.
    pub fn from_raw(from: &str, to: &str, raw: impl AsRef<[u8]>) -> Self {
        let raw = raw.as_ref();
        let (headers, content) = parse_raw_headers(raw);
        let mut headers = HeaderMap::from(headers);
        let subject = headers.remove("Subject").unwrap_or_default();
        let mut message = Self::new(
            from.to_string(),
            to.to_string(),
            subject,
            content.to_vec(),
            headers,
        );
        message.received = Some(Received {
            raw: raw.to_vec(),
            body_offset: raw.len() - content.len(),
            subject: message.subject.clone(),
            headers: message.headers.clone(),
        });
        message
    }

    /// Returns the first header value matching `name` (case-insensitive).
    ///
    /// `Subject` is answered from the dedicated subject field.
    pub fn header(&self, name: &str) -> Option<&str> {
        if name.eq_ignore_ascii_case("Subject") {
            return Some(self.subject.as_str());
        }
        self.headers.get(name)
    }

    /// Returns the body as text, replacing invalid UTF-8 sequences.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Applies a single header to the message.
    ///
    /// Name and value are trimmed and the header replaces any existing one
    /// of the same name. When the header is `Content-Type` the message's
    /// content type is also set to the value's media type.
    pub fn apply_header(&mut self, name: &str, value: &str) {
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("Subject") {
            self.subject = value.to_string();
            return;
        }
        if name.eq_ignore_ascii_case("content-type") {
            self.content_type = media_type(value).to_string();
        }
        self.headers.set(name, value);
    }

    /// Applies a raw `Name: value` header line, lines without a `:`
    /// separator are ignored.
    pub fn apply_header_line(&mut self, line: &str) {
        if let Some((name, value)) = line.split_once(':') {
            self.apply_header(name, value);
        }
    }

    /// Serializes the message to wire format.
    ///
    /// A message parsed by [`from_raw`](Self::from_raw) whose subject, body
    /// and headers are unchanged is emitted exactly as received, headers
    /// prepended since then go in front of it. Any other message is
    /// rebuilt: headers, the `Subject` header, a blank line and the body,
    /// all with CRLF line endings.
    pub fn to_bytes(&self) -> Vec<u8> {
        if let Some((received, prepended)) = self.unchanged_since_received() {
            let mut raw = Vec::with_capacity(received.raw.len() + prepended * 64);
            for (key, value) in self.headers.iter().take(prepended) {
                write_header(&mut raw, key, value);
            }
            raw.extend_from_slice(&received.raw);
            return raw;
        }

        let headers_len: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.len() + 2 + v.len() + 2)
            .sum();
        let subject_len = if self.subject.is_empty() {
            0
        } else {
            self.subject.len() + 11
        };

        let mut raw = Vec::with_capacity(headers_len + subject_len + 2 + self.body.len());

        for (key, value) in self.headers.iter() {
            write_header(&mut raw, key, value);
        }
        if !self.subject.is_empty() {
            write_header(&mut raw, "Subject", &self.subject);
        }
        raw.extend_from_slice(b"\r\n");
        raw.extend_from_slice(&self.body);
        raw
    }

    /// Returns the received form and the number of headers prepended to it
    /// when nothing else changed since parsing.
    fn unchanged_since_received(&self) -> Option<(&Received, usize)> {
        let received = self.received.as_ref()?;
        if self.subject != received.subject || self.body[..] != received.raw[received.body_offset..] {
            return None;
        }
        let prepended = self.headers.len().checked_sub(received.headers.len())?;
        // a header can only be put in front of an existing header section
        if prepended > 0 && received.body_offset == 0 {
            return None;
        }
        self.headers
            .iter()
            .skip(prepended)
            .eq(received.headers.iter())
            .then_some((received, prepended))
    }
}

fn write_header(raw: &mut Vec<u8>, key: &str, value: &str) {
    raw.extend_from_slice(key.as_bytes());
    raw.extend_from_slice(b": ");
    raw.extend_from_slice(value.as_bytes());
    raw.extend_from_slice(b"\r\n");
}

/// An incoming email message with its SMTP envelope.
///
/// Represents a message received over SMTP before it is split into
/// per-recipient [`OutboundMessage`] instances for the pipeline.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Envelope sender address.
    pub from: String,

    /// Envelope recipient addresses, ordered for deterministic processing.
    pub rcpts: BTreeSet<String>,

    /// Raw message data (headers + content) as received.
    pub raw: Vec<u8>,
}

impl IncomingMessage {
    /// Creates an [`OutboundMessage`] for a specific recipient from this incoming message.
    pub fn to_outbound(&self, rcpt: &str) -> OutboundMessage {
        OutboundMessage::from_raw(&self.from, rcpt, &self.raw)
    }
}
