//! RESP2 request encoding and reply parsing.
//!
//! Only what a client needs: commands are always arrays of bulk strings,
//! replies may be any RESP2 type.

use bytes::{BufMut, BytesMut};

use expose_reconcile::StoreError;

const MAX_NESTING_DEPTH: usize = 8;
const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// A parsed server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    /// `None` for the null bulk string.
    Bulk(Option<Vec<u8>>),
    /// `None` for the null array.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Turn an error reply into a [`StoreError::Server`].
    pub fn into_result(self) -> Result<Reply, StoreError> {
        match self {
            Reply::Error(message) => Err(StoreError::Server(message)),
            other => Ok(other),
        }
    }

    pub fn into_string(self) -> Result<String, StoreError> {
        match self {
            Reply::Simple(s) => Ok(s),
            Reply::Bulk(Some(bytes)) => String::from_utf8(bytes)
                .map_err(|_| StoreError::Protocol("reply is not valid UTF-8".into())),
            Reply::Error(message) => Err(StoreError::Server(message)),
            other => Err(StoreError::Protocol(format!(
                "expected string reply, got {other:?}"
            ))),
        }
    }
}

/// Append a command as an array of bulk strings.
pub fn encode_command(buf: &mut BytesMut, args: &[&str]) {
    buf.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.put_slice(arg.as_bytes());
        buf.put_slice(b"\r\n");
    }
}

/// Parse one reply from the front of `data`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the reply and
/// the number of bytes it used.
pub fn parse_reply(data: &[u8]) -> Result<Option<(Reply, usize)>, StoreError> {
    parse_value(data, 0)
}

fn parse_value(data: &[u8], depth: usize) -> Result<Option<(Reply, usize)>, StoreError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(StoreError::Protocol("maximum nesting depth exceeded".into()));
    }
    let Some((&type_byte, rest)) = data.split_first() else {
        return Ok(None);
    };
    let Some(line_end) = find_crlf(rest) else {
        return Ok(None);
    };
    let line = std::str::from_utf8(&rest[..line_end])
        .map_err(|_| StoreError::Protocol("reply header is not valid UTF-8".into()))?;
    // Type byte, line, CRLF.
    let header_len = 1 + line_end + 2;

    match type_byte {
        b'+' => Ok(Some((Reply::Simple(line.to_string()), header_len))),
        b'-' => Ok(Some((Reply::Error(line.to_string()), header_len))),
        b':' => {
            let n = parse_int(line)?;
            Ok(Some((Reply::Integer(n), header_len)))
        }
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Reply::Bulk(None), header_len)));
            }
            let len = len as usize;
            if len > MAX_BULK_SIZE {
                return Err(StoreError::Protocol(format!(
                    "bulk string too large: {len} > {MAX_BULK_SIZE}"
                )));
            }

            let end = header_len + len;
            if data.len() < end + 2 {
                return Ok(None);
            }
            if &data[end..end + 2] != b"\r\n" {
                return Err(StoreError::Protocol("missing CRLF after bulk string".into()));
            }
            Ok(Some((Reply::Bulk(Some(data[header_len..end].to_vec())), end + 2)))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((Reply::Array(None), header_len)));
            }

            let mut items = Vec::with_capacity(count.min(1024) as usize);
            let mut used = header_len;
            for _ in 0..count {
                match parse_value(&data[used..], depth + 1)? {
                    Some((item, n)) => {
                        items.push(item);
                        used += n;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(Some(items)), used)))
        }
        other => Err(StoreError::Protocol(format!(
            "unexpected reply type byte {:?}",
            other as char
        ))),
    }
}

fn parse_int(line: &str) -> Result<i64, StoreError> {
    line.parse::<i64>()
        .map_err(|_| StoreError::Protocol(format!("invalid integer {line:?}")))
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}
