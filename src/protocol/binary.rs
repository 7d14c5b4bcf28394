//! 24-byte header binary protocol codec.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cache::Cache;
use crate::error::CacheError;

const REQUEST_MAGIC: u8 = 0x80;
const RESPONSE_MAGIC: u8 = 0x81;

mod opcode {
    pub const GET: u8 = 0x00;
    pub const SET: u8 = 0x01;
    pub const ADD: u8 = 0x02;
    pub const REPLACE: u8 = 0x03;
    pub const DELETE: u8 = 0x04;
    pub const INCREMENT: u8 = 0x05;
    pub const DECREMENT: u8 = 0x06;
    pub const QUIT: u8 = 0x07;
    pub const FLUSH: u8 = 0x08;
    pub const GETQ: u8 = 0x09;
    pub const NOOP: u8 = 0x0A;
    pub const VERSION: u8 = 0x0B;
    pub const GETK: u8 = 0x0C;
    pub const GETKQ: u8 = 0x0D;
    pub const APPEND: u8 = 0x0E;
    pub const PREPEND: u8 = 0x0F;
    pub const STAT: u8 = 0x10;
    pub const SETQ: u8 = 0x11;
    pub const ADDQ: u8 = 0x12;
    pub const REPLACEQ: u8 = 0x13;
    pub const DELETEQ: u8 = 0x14;
    pub const INCREMENTQ: u8 = 0x15;
    pub const DECREMENTQ: u8 = 0x16;
    pub const QUITQ: u8 = 0x17;
    pub const FLUSHQ: u8 = 0x18;
    pub const APPENDQ: u8 = 0x19;
    pub const PREPENDQ: u8 = 0x1A;
    pub const TOUCHQ: u8 = 0x1C;
    pub const GAT: u8 = 0x1D;
    pub const GATQ: u8 = 0x1E;
}

struct RequestHeader {
    opcode: u8,
    key_len: u16,
    extras_len: u8,
    total_body_len: u32,
    opaque: u32,
    cas: u64,
}

impl RequestHeader {
    fn parse(buf: &[u8; 24]) -> Result<Self, CacheError> {
        if buf[0] != REQUEST_MAGIC {
            return Err(CacheError::Malformed("invalid request magic".into()));
        }
        Ok(Self {
            opcode: buf[1],
            key_len: u16::from_be_bytes([buf[2], buf[3]]),
            extras_len: buf[4],
            total_body_len: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        })
    }
}

struct Request {
    header: RequestHeader,
    extras: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
}

/// Builds one response frame: header + extras + key + value.
fn build_response(opcode: u8, status: u16, opaque: u32, cas: u64, extras: &[u8], key: &[u8], value: &[u8]) -> BytesMut {
    let body_len = extras.len() + key.len() + value.len();
    let mut out = BytesMut::with_capacity(24 + body_len);
    out.put_u8(RESPONSE_MAGIC);
    out.put_u8(opcode);
    out.put_u16(key.len() as u16);
    out.put_u8(extras.len() as u8);
    out.put_u8(0); // data type
    out.put_u16(status);
    out.put_u32(body_len as u32);
    out.put_u32(opaque);
    out.put_u64(cas);
    out.put_slice(extras);
    out.put_slice(key);
    out.put_slice(value);
    out
}

fn error_response(opcode: u8, opaque: u32, err: &CacheError) -> BytesMut {
    build_response(opcode, err.binary_status(), opaque, 0, &[], &[], err.binary_body().as_bytes())
}

fn ok_response(opcode: u8, opaque: u32, cas: u64, extras: &[u8], key: &[u8], value: &[u8]) -> BytesMut {
    build_response(opcode, 0x0000, opaque, cas, extras, key, value)
}

/// Reads and dispatches binary-protocol requests from `reader` until the
/// client sends a Quit opcode or disconnects, writing responses to `writer`.
pub async fn serve<R, W>(mut reader: R, mut writer: W, cache: Arc<Cache>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let mut header_buf = [0u8; 24];
        if reader.read_exact(&mut header_buf).await.is_err() {
            return;
        }
        let header = match RequestHeader::parse(&header_buf) {
            Ok(h) => h,
            Err(_) => return, // magic mismatch: framing unrecoverable, close
        };
        let body_len = header.total_body_len as usize;
        let extras_len = header.extras_len as usize;
        let key_len = header.key_len as usize;
        if extras_len + key_len > body_len {
            return;
        }
        let mut body = vec![0u8; body_len];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }
        let extras = body[..extras_len].to_vec();
        let key = body[extras_len..extras_len + key_len].to_vec();
        let value = body[extras_len + key_len..].to_vec();
        let opaque = header.opaque;
        let opcode = header.opcode;
        let request_cas = header.cas;

        if opcode == opcode::QUIT || opcode == opcode::QUITQ {
            if opcode == opcode::QUIT {
                let resp = ok_response(opcode, opaque, 0, &[], &[], &[]);
                let _ = writer.write_all(&resp).await;
                let _ = writer.flush().await;
            }
            return;
        }

        let req = Request { header, extras, key, value };

        if opcode == opcode::STAT {
            let stats = cache.stats().await;
            for (name, value) in &stats {
                let resp = ok_response(opcode, opaque, 0, &[], name.as_bytes(), value.as_bytes());
                if writer.write_all(&resp).await.is_err() {
                    return;
                }
            }
            // Terminal frame: empty key and value signal the end of the
            // stat sequence.
            let terminator = ok_response(opcode, opaque, 0, &[], &[], &[]);
            if writer.write_all(&terminator).await.is_err() || writer.flush().await.is_err() {
                return;
            }
            continue;
        }

        let response = handle(&req, request_cas, cache.as_ref()).await;
        if let Some(resp) = response {
            if writer.write_all(&resp).await.is_err() {
                return;
            }
            if writer.flush().await.is_err() {
                return;
            }
        }
    }
}

fn is_quiet(opcode: u8) -> bool {
    matches!(
        opcode,
        opcode::GETQ
            | opcode::SETQ
            | opcode::ADDQ
            | opcode::REPLACEQ
            | opcode::DELETEQ
            | opcode::INCREMENTQ
            | opcode::DECREMENTQ
            | opcode::FLUSHQ
            | opcode::APPENDQ
            | opcode::PREPENDQ
            | opcode::GETKQ
            | opcode::TOUCHQ
            | opcode::GATQ
    )
}

/// Runs one request against the cache and builds its response frame, or
/// `None` when a quiet opcode succeeded and must produce no response.
async fn handle(req: &Request, request_cas: u64, cache: &Cache) -> Option<BytesMut> {
    let opcode = req.header.opcode;
    let opaque = req.header.opaque;
    let quiet = is_quiet(opcode);
    let include_key_in_response = matches!(opcode, opcode::GETK | opcode::GETKQ);

    match opcode {
        opcode::GET | opcode::GETQ | opcode::GETK | opcode::GETKQ => {
            match cache.get(&req.key).await {
                Ok((value, flags, cas)) => {
                    let mut extras = [0u8; 4];
                    extras.copy_from_slice(&flags.to_be_bytes());
                    let key = if include_key_in_response { req.key.as_slice() } else { &[] };
                    if quiet {
                        None
                    } else {
                        Some(ok_response(opcode, opaque, cas, &extras, key, &value))
                    }
                }
                Err(e) => Some(error_response(opcode, opaque, &e)),
            }
        }
        opcode::SET | opcode::SETQ | opcode::ADD | opcode::ADDQ | opcode::REPLACE | opcode::REPLACEQ => {
            if req.extras.len() != 8 {
                return Some(error_response(opcode, opaque, &CacheError::Malformed("bad extras".into())));
            }
            let flags = u32::from_be_bytes([req.extras[0], req.extras[1], req.extras[2], req.extras[3]]);
            let ttl = u32::from_be_bytes([req.extras[4], req.extras[5], req.extras[6], req.extras[7]]) as i64;
            let result = match opcode {
                opcode::SET | opcode::SETQ => {
                    if request_cas != 0 {
                        cache.cas(req.key.clone(), req.value.clone(), flags, ttl, request_cas).await
                    } else {
                        cache.set(req.key.clone(), req.value.clone(), flags, ttl).await
                    }
                }
                opcode::ADD | opcode::ADDQ => cache.add(req.key.clone(), req.value.clone(), flags, ttl).await,
                _ => cache.replace(req.key.clone(), req.value.clone(), flags, ttl).await,
            };
            match result {
                Ok(cas) => {
                    if quiet {
                        None
                    } else {
                        Some(ok_response(opcode, opaque, cas, &[], &[], &[]))
                    }
                }
                Err(e) => Some(error_response(opcode, opaque, &e)),
            }
        }
        opcode::DELETE | opcode::DELETEQ => match cache.delete(&req.key).await {
            Ok(()) => {
                if quiet {
                    None
                } else {
                    Some(ok_response(opcode, opaque, 0, &[], &[], &[]))
                }
            }
            Err(e) => Some(error_response(opcode, opaque, &e)),
        },
        opcode::INCREMENT | opcode::INCREMENTQ | opcode::DECREMENT | opcode::DECREMENTQ => {
            if req.extras.len() != 20 {
                return Some(error_response(opcode, opaque, &CacheError::Malformed("bad extras".into())));
            }
            let delta = u64::from_be_bytes(req.extras[0..8].try_into().unwrap());
            let initial = u64::from_be_bytes(req.extras[8..16].try_into().unwrap());
            let expiration = u32::from_be_bytes(req.extras[16..20].try_into().unwrap());
            let increment = matches!(opcode, opcode::INCREMENT | opcode::INCREMENTQ);
            let result = if expiration != 0xFFFF_FFFF {
                if increment {
                    cache.incr_or_init(req.key.clone(), delta, initial, expiration as i64).await
                } else {
                    cache.decr_or_init(req.key.clone(), delta, initial, expiration as i64).await
                }
            } else if increment {
                cache.incr(&req.key, delta).await
            } else {
                cache.decr(&req.key, delta).await
            };
            match result {
                Ok((new_value, cas)) => {
                    if quiet {
                        None
                    } else {
                        Some(ok_response(opcode, opaque, cas, &[], &[], &new_value.to_be_bytes()))
                    }
                }
                Err(e) => Some(error_response(opcode, opaque, &e)),
            }
        }
        opcode::APPEND | opcode::APPENDQ | opcode::PREPEND | opcode::PREPENDQ => {
            let prepend = matches!(opcode, opcode::PREPEND | opcode::PREPENDQ);
            let result = if prepend {
                cache.prepend(&req.key, req.value.clone()).await
            } else {
                cache.append(&req.key, req.value.clone()).await
            };
            match result {
                Ok(cas) => {
                    if quiet {
                        None
                    } else {
                        Some(ok_response(opcode, opaque, cas, &[], &[], &[]))
                    }
                }
                Err(e) => Some(error_response(opcode, opaque, &e)),
            }
        }
        opcode::TOUCHQ => {
            if req.extras.len() != 4 {
                return Some(error_response(opcode, opaque, &CacheError::Malformed("bad extras".into())));
            }
            let ttl = u32::from_be_bytes(req.extras[0..4].try_into().unwrap()) as i64;
            match cache.touch(&req.key, ttl).await {
                Ok(_) => None,
                Err(e) => Some(error_response(opcode, opaque, &e)),
            }
        }
        opcode::GAT | opcode::GATQ => {
            if req.extras.len() != 4 {
                return Some(error_response(opcode, opaque, &CacheError::Malformed("bad extras".into())));
            }
            let ttl = u32::from_be_bytes(req.extras[0..4].try_into().unwrap()) as i64;
            match cache.get_and_touch(&req.key, ttl).await {
                Ok((value, flags, cas)) => {
                    if quiet {
                        None
                    } else {
                        Some(ok_response(opcode, opaque, cas, &flags.to_be_bytes(), &[], &value))
                    }
                }
                Err(e) => Some(error_response(opcode, opaque, &e)),
            }
        }
        opcode::FLUSH | opcode::FLUSHQ => {
            cache.flush_all().await;
            if quiet {
                None
            } else {
                Some(ok_response(opcode, opaque, 0, &[], &[], &[]))
            }
        }
        opcode::NOOP => Some(ok_response(opcode, opaque, 0, &[], &[], &[])),
        opcode::VERSION => {
            let version = env!("CARGO_PKG_VERSION");
            Some(ok_response(opcode, opaque, 0, &[], &[], version.as_bytes()))
        }
        _ => Some(error_response(opcode, opaque, &CacheError::Unknown)),
    }
}
