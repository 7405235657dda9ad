use std::fmt::Write as _;
use std::io::{self, Read};
use std::time::Duration;

use thiserror::Error;

const MAX_BODY_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub method: Method,
    pub url: &'a str,
    pub timeout: Duration,
}

impl<'a> Request<'a> {
    pub fn get(url: &'a str, timeout: Duration) -> Self {
        Self {
            method: Method::Get,
            url,
            timeout,
        }
    }

    pub fn head(url: &'a str, timeout: Duration) -> Self {
        Self {
            method: Method::Head,
            url,
            timeout,
        }
    }
}

pub struct Response<'a> {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + 'a>,
}

impl Response<'_> {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("read failed: {0}")]
    Read(String),
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout,
            _ => TransportError::Read(e.to_string()),
        }
    }
}

/// HTTP(S) client used by the firmware updater and the bot channel.
///
/// Trust material is configured when the transport is built, every request
/// carries its own timeout.
pub trait Transport: Send {
    fn open(&mut self, request: &Request<'_>) -> Result<Response<'_>, TransportError>;

    fn fetch(&mut self, request: &Request<'_>) -> Result<Reply, TransportError> {
        let response = self.open(request)?;
        let status = response.status;
        let mut body = Vec::new();
        response
            .body
            .take(MAX_BODY_LEN as u64 + 1)
            .read_to_end(&mut body)?;
        if body.len() > MAX_BODY_LEN {
            return Err(TransportError::Read(format!(
                "response body exceeds {} bytes",
                MAX_BODY_LEN
            )));
        }
        Ok(Reply { status, body })
    }
}

/// RFC 3986 percent-encoding for query values.
pub fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                let _ = write!(out, "%{:02X}", byte);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreserved_characters_pass_through() {
        assert_eq!(percent_encode("AZaz09-_.~"), "AZaz09-_.~");
    }

    #[test]
    fn reserved_and_multibyte_characters_are_escaped() {
        assert_eq!(
            percent_encode("interval set to 5000 ms & done?"),
            "interval%20set%20to%205000%20ms%20%26%20done%3F"
        );
        assert_eq!(percent_encode("é/+"), "%C3%A9%2F%2B");
    }

    #[test]
    fn timeout_io_errors_map_to_timeout() {
        let err: TransportError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(err, TransportError::Timeout));
    }
}
