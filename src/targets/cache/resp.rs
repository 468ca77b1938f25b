//! RESP2 framing for the Redis client
//!
//! Frames are parsed from a borrowed slice first and the buffer is only
//! advanced once a whole frame is present, so a partial read never loses
//! bytes.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RespError {
    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type RespResult<T> = Result<T, RespError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string
    Bulk(Option<Vec<u8>>),
    /// `None` is the null array
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Take one complete frame off the front of `buf`, if there is one
    pub fn decode(buf: &mut BytesMut) -> RespResult<Option<RespValue>> {
        match parse(&buf[..])? {
            Some((value, used)) => {
                buf.advance(used);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            RespValue::Simple(s) => Some(s.clone()),
            RespValue::Bulk(Some(data)) => String::from_utf8(data.clone()).ok(),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(Some(items)) => Some(items),
            _ => None,
        }
    }
}

/// Encode a command as an array of bulk strings
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        let arg = arg.as_ref();
        buf.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
    buf
}

fn line(input: &[u8]) -> Option<(&[u8], usize)> {
    input
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|pos| (&input[..pos], pos + 2))
}

fn text(raw: &[u8]) -> RespResult<String> {
    String::from_utf8(raw.to_vec()).map_err(|e| RespError::Protocol(e.to_string()))
}

fn number(raw: &[u8]) -> RespResult<i64> {
    text(raw)?
        .parse()
        .map_err(|e| RespError::Protocol(format!("Invalid length or integer: {}", e)))
}

/// Parse one frame; `None` when more bytes are needed
fn parse(input: &[u8]) -> RespResult<Option<(RespValue, usize)>> {
    let Some(&kind) = input.first() else {
        return Ok(None);
    };
    let Some((header, mut used)) = line(&input[1..]) else {
        return Ok(None);
    };
    used += 1;

    let value = match kind {
        b'+' => RespValue::Simple(text(header)?),
        b'-' => RespValue::Error(text(header)?),
        b':' => RespValue::Integer(number(header)?),
        b'$' => {
            let len = number(header)?;
            if len < 0 {
                RespValue::Bulk(None)
            } else {
                let len = len as usize;
                if input.len() < used + len + 2 {
                    return Ok(None);
                }
                if &input[used + len..used + len + 2] != b"\r\n" {
                    return Err(RespError::Protocol("Bulk string not terminated".to_string()));
                }
                let data = input[used..used + len].to_vec();
                used += len + 2;
                RespValue::Bulk(Some(data))
            }
        }
        b'*' => {
            let len = number(header)?;
            if len < 0 {
                RespValue::Array(None)
            } else {
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    match parse(&input[used..])? {
                        Some((item, n)) => {
                            items.push(item);
                            used += n;
                        }
                        None => return Ok(None),
                    }
                }
                RespValue::Array(Some(items))
            }
        }
        other => {
            return Err(RespError::Protocol(format!(
                "Unknown RESP type byte '{}'",
                other as char
            )))
        }
    };

    Ok(Some((value, used)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_command() {
        let buf = encode_command(&["SADD", "students:all", "7"]);
        assert_eq!(&buf[..], b"*3\r\n$4\r\nSADD\r\n$12\r\nstudents:all\r\n$1\r\n7\r\n");
    }

    #[test]
    fn test_decode_scan_reply() {
        let mut buf = BytesMut::from(&b"*2\r\n$1\r\n0\r\n*2\r\n$9\r\nstudent:1\r\n$9\r\nstudent:2\r\n"[..]);
        let value = RespValue::decode(&mut buf).unwrap().unwrap();
        let parts = value.into_array().unwrap();
        assert_eq!(parts[0].as_text().unwrap(), "0");
        let keys: Vec<String> = parts[1]
            .clone()
            .into_array()
            .unwrap()
            .iter()
            .filter_map(RespValue::as_text)
            .collect();
        assert_eq!(keys, vec!["student:1", "student:2"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_is_left_in_buffer() {
        let mut buf = BytesMut::from(&b"$5\r\nhel"[..]);
        assert_eq!(RespValue::decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 7);

        buf.extend_from_slice(b"lo\r\n:3\r\n");
        assert_eq!(
            RespValue::decode(&mut buf).unwrap(),
            Some(RespValue::Bulk(Some(b"hello".to_vec())))
        );
        assert_eq!(RespValue::decode(&mut buf).unwrap(), Some(RespValue::Integer(3)));
    }

    #[test]
    fn test_nulls_and_errors() {
        let mut buf = BytesMut::from(&b"$-1\r\n*-1\r\n-ERR unknown command\r\n"[..]);
        assert_eq!(RespValue::decode(&mut buf).unwrap(), Some(RespValue::Bulk(None)));
        assert_eq!(RespValue::decode(&mut buf).unwrap(), Some(RespValue::Array(None)));
        assert_eq!(
            RespValue::decode(&mut buf).unwrap(),
            Some(RespValue::Error("ERR unknown command".to_string()))
        );
    }

    #[test]
    fn test_unknown_type_byte() {
        let mut buf = BytesMut::from(&b"?x\r\n"[..]);
        assert!(RespValue::decode(&mut buf).is_err());
    }
}
