//! Just enough of RESP (the Redis serialization protocol) to issue
//! `SET`/`GET`/`DEL`/`PTTL` and read their replies.

use bytes::{Buf, BufMut, BytesMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

pub(crate) fn encode_command(args: &[&[u8]], dst: &mut BytesMut) {
    dst.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        dst.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        dst.put_slice(arg);
        dst.put_slice(b"\r\n");
    }
}

/// Take one complete reply off the front of `src`.
/// `Ok(None)` means more bytes are needed.
pub(crate) fn decode(src: &mut BytesMut) -> Result<Option<Reply>, String> {
    match parse(src, 0)? {
        Some((reply, consumed)) => {
            src.advance(consumed);
            Ok(Some(reply))
        }
        None => Ok(None),
    }
}

fn line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(pos..)?;
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..end], pos + end + 2))
}

fn integer(line: &[u8]) -> Result<i64, String> {
    std::str::from_utf8(line)
        .map_err(|e| format!("{e}"))?
        .parse::<i64>()
        .map_err(|e| format!("integer: {e}"))
}

fn parse(buf: &[u8], pos: usize) -> Result<Option<(Reply, usize)>, String> {
    let Some(&prefix) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((head, next)) = line(buf, pos + 1) else {
        return Ok(None);
    };
    match prefix {
        b'+' => Ok(Some((
            Reply::Simple(String::from_utf8_lossy(head).into_owned()),
            next,
        ))),
        b'-' => Ok(Some((
            Reply::Error(String::from_utf8_lossy(head).into_owned()),
            next,
        ))),
        b':' => Ok(Some((Reply::Integer(integer(head)?), next))),
        b'$' => {
            let len = integer(head)?;
            if len < 0 {
                return Ok(Some((Reply::Bulk(None), next)));
            }
            let end = next + len as usize;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err("bulk string not terminated".to_string());
            }
            Ok(Some((Reply::Bulk(Some(buf[next..end].to_vec())), end + 2)))
        }
        b'*' => {
            let len = integer(head)?;
            if len < 0 {
                return Ok(Some((Reply::Array(None), next)));
            }
            let mut items = Vec::with_capacity(len as usize);
            let mut cursor = next;
            for _ in 0..len {
                match parse(buf, cursor)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(Some(items)), cursor)))
        }
        other => Err(format!("unexpected reply prefix {other:#x}")),
    }
}
