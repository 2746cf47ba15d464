//! Minimal push-file sub-protocol spoken to a remote `scp -t` sink.
//!
//! The exchange is: sink acknowledges readiness, client sends a header line
//! `C<mode> <size> <name>\n`, sink acknowledges, client streams exactly
//! `<size>` bytes followed by a single `\0`, sink acknowledges again. Every
//! acknowledgement is a `\0` byte; `\x01` and `\x02` carry an error message
//! terminated by a newline.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Errors raised while pushing a file over the protocol.
#[derive(Debug, Error, Eq, PartialEq)]
pub(crate) enum PushError {
    #[error("i/o error: {0}")]
    Io(String),
    #[error("invalid remote file name {0:?}")]
    InvalidName(String),
    #[error("local file ended after {actual} of {expected} bytes")]
    ShortRead { expected: u64, actual: u64 },
    #[error("remote sink rejected transfer: {0}")]
    Rejected(String),
    #[error("unexpected acknowledgement byte {0:#04x}")]
    UnexpectedAck(u8),
}

impl From<io::Error> for PushError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// Header line announcing a single file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct PushHeader {
    mode: u32,
    size: u64,
    name: String,
}

impl PushHeader {
    pub(crate) fn new(mode: u32, size: u64, name: &str) -> Result<Self, PushError> {
        if name.is_empty() || name.contains(['/', '\n', '\0']) {
            return Err(PushError::InvalidName(name.to_owned()));
        }
        Ok(Self {
            mode: mode & 0o7777,
            size,
            name: name.to_owned(),
        })
    }

    pub(crate) const fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn encode(&self) -> String {
        format!("C{:04o} {} {}\n", self.mode, self.size, self.name)
    }
}

/// Streams `content` to the sink on `stream`, returning once the sink has
/// acknowledged the terminator.
pub(crate) fn push_file<S, C>(
    stream: &mut S,
    header: &PushHeader,
    content: &mut C,
) -> Result<(), PushError>
where
    S: Read + Write,
    C: Read,
{
    read_ack(stream)?;
    stream.write_all(header.encode().as_bytes())?;
    read_ack(stream)?;

    let copied = io::copy(&mut content.take(header.size()), stream)?;
    if copied != header.size() {
        return Err(PushError::ShortRead {
            expected: header.size(),
            actual: copied,
        });
    }

    stream.write_all(b"\0")?;
    stream.flush()?;
    read_ack(stream)
}

fn read_ack<S: Read>(stream: &mut S) -> Result<(), PushError> {
    let mut byte = [0_u8; 1];
    stream.read_exact(&mut byte)?;
    match byte {
        [0] => Ok(()),
        [1 | 2] => Err(PushError::Rejected(read_message(stream)?)),
        [other] => Err(PushError::UnexpectedAck(other)),
    }
}

fn read_message<S: Read>(stream: &mut S) -> Result<String, PushError> {
    let mut message = Vec::new();
    for next in stream.bytes() {
        let byte = next?;
        if byte == b'\n' {
            break;
        }
        message.push(byte);
    }
    Ok(String::from_utf8_lossy(&message).trim().to_owned())
}
