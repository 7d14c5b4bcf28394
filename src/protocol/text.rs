//! Line-based text protocol codec (the classic Memcached ASCII protocol).

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::cache::Cache;
use crate::error::CacheError;
use crate::limits::{MAX_KEY_LEN, MAX_VALUE_LEN};

/// Reads and dispatches text-protocol commands from `reader` until the
/// client sends `quit` or disconnects, writing responses to `writer`.
pub async fn serve<R, W>(reader: R, writer: W, cache: Arc<Cache>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        let _ = bytes_read;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = trimmed.split(' ').filter(|t| !t.is_empty()).collect();

        let keep_going = dispatch(&tokens, &mut reader, &mut writer, &cache).await;
        if !keep_going {
            break;
        }

        // Coalesce pipelined responses: only flush once there is nothing
        // left immediately available to read.
        if reader.buffer().is_empty() {
            if writer.flush().await.is_err() {
                break;
            }
        }
    }
    let _ = writer.flush().await;
}

/// Dispatches one parsed command line. Returns `false` when the connection
/// should close (i.e. after `quit`).
async fn dispatch<R, W>(
    tokens: &[&str],
    reader: &mut BufReader<R>,
    writer: &mut BufWriter<W>,
    cache: &Arc<Cache>,
) -> bool
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(&verb) = tokens.first() else {
        return true;
    };

    match verb {
        "get" | "gets" => {
            let with_cas = verb == "gets";
            handle_get(&tokens[1..], with_cas, writer, cache).await;
        }
        "set" | "add" | "replace" | "append" | "prepend" => {
            handle_storage(verb, &tokens[1..], reader, writer, cache).await;
        }
        "cas" => {
            handle_cas(&tokens[1..], reader, writer, cache).await;
        }
        "delete" => {
            handle_delete(&tokens[1..], writer, cache).await;
        }
        "incr" | "decr" => {
            handle_arith(verb == "incr", &tokens[1..], writer, cache).await;
        }
        "touch" => {
            handle_touch(&tokens[1..], writer, cache).await;
        }
        "flush_all" => {
            handle_flush_all(&tokens[1..], writer, cache).await;
        }
        "stats" => {
            handle_stats(writer, cache).await;
        }
        "version" => {
            let _ = write_line(writer, &format!("VERSION {}", env!("CARGO_PKG_VERSION"))).await;
        }
        "quit" => {
            return false;
        }
        _ => {
            let _ = write_line(writer, &CacheError::Unknown.text_line()).await;
        }
    }
    true
}

fn strip_noreply<'a>(tokens: &'a [&'a str]) -> (&'a [&'a str], bool) {
    match tokens.split_last() {
        Some((&last, rest)) if last == "noreply" => (rest, true),
        _ => (tokens, false),
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await
}

async fn handle_get<W: AsyncWrite + Unpin>(
    keys: &[&str],
    with_cas: bool,
    writer: &mut W,
    cache: &Arc<Cache>,
) {
    if keys.is_empty() {
        let _ = write_line(writer, &CacheError::Malformed("bad command line format".into()).text_line()).await;
        return;
    }
    for key in keys {
        if let Ok((value, flags, cas)) = cache.get(key.as_bytes()).await {
            let header = if with_cas {
                format!("VALUE {key} {flags} {} {cas}", value.len())
            } else {
                format!("VALUE {key} {flags} {}", value.len())
            };
            if write_line(writer, &header).await.is_err() {
                return;
            }
            if writer.write_all(&value).await.is_err() {
                return;
            }
            if writer.write_all(b"\r\n").await.is_err() {
                return;
            }
        }
    }
    let _ = write_line(writer, "END").await;
}

struct StorageArgs {
    key: String,
    flags: u32,
    ttl: i64,
    len: usize,
    cas: Option<u64>,
    noreply: bool,
}

fn parse_storage_line(tokens: &[&str], expect_cas: bool) -> Result<StorageArgs, CacheError> {
    let (tokens, noreply) = strip_noreply(tokens);
    let min = if expect_cas { 5 } else { 4 };
    if tokens.len() != min {
        return Err(CacheError::Malformed("bad command line format".into()));
    }
    let key = tokens[0].to_string();
    let flags: u32 = tokens[1]
        .parse()
        .map_err(|_| CacheError::Malformed("bad command line format".into()))?;
    let ttl: i64 = tokens[2]
        .parse()
        .map_err(|_| CacheError::Malformed("bad command line format".into()))?;
    let len: usize = tokens[3]
        .parse()
        .map_err(|_| CacheError::Malformed("bad command line format".into()))?;
    let cas = if expect_cas {
        Some(
            tokens[4]
                .parse()
                .map_err(|_| CacheError::Malformed("bad command line format".into()))?,
        )
    } else {
        None
    };
    Ok(StorageArgs {
        key,
        flags,
        ttl,
        len,
        cas,
        noreply,
    })
}

/// Reads exactly `len` payload bytes followed by the terminating CRLF. The
/// read always happens even when `len` will later be rejected as oversize,
/// so the stream stays framed for the next command.
async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Vec<u8>, CacheError> {
    let mut buf = vec![0u8; len + 2];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| CacheError::Internal(e.to_string()))?;
    if &buf[len..] != b"\r\n" {
        return Err(CacheError::Malformed("bad data chunk".into()));
    }
    buf.truncate(len);
    if len > MAX_VALUE_LEN {
        return Err(CacheError::ValueTooLarge);
    }
    Ok(buf)
}

async fn handle_storage<R, W>(
    verb: &str,
    tokens: &[&str],
    reader: &mut R,
    writer: &mut W,
    cache: &Arc<Cache>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let args = match parse_storage_line(tokens, false) {
        Ok(a) => a,
        Err(e) => {
            let _ = write_line(writer, &e.text_line()).await;
            return;
        }
    };
    let value = match read_payload(reader, args.len).await {
        Ok(v) => v,
        Err(e) => {
            if !args.noreply {
                let _ = write_line(writer, &e.text_line()).await;
            }
            return;
        }
    };
    if args.key.len() > MAX_KEY_LEN || args.key.is_empty() {
        if !args.noreply {
            let _ = write_line(writer, &CacheError::KeyTooLarge.text_line()).await;
        }
        return;
    }

    let result = match verb {
        "set" => cache.set(args.key.into_bytes(), value, args.flags, args.ttl).await,
        "add" => cache.add(args.key.into_bytes(), value, args.flags, args.ttl).await,
        "replace" => cache.replace(args.key.into_bytes(), value, args.flags, args.ttl).await,
        "append" => cache.append(args.key.as_bytes(), value).await,
        "prepend" => cache.prepend(args.key.as_bytes(), value).await,
        _ => unreachable!(),
    };

    if args.noreply {
        return;
    }
    match result {
        Ok(_) => {
            let _ = write_line(writer, "STORED").await;
        }
        Err(e) => {
            let _ = write_line(writer, &e.text_line()).await;
        }
    }
}

async fn handle_cas<R, W>(tokens: &[&str], reader: &mut R, writer: &mut W, cache: &Arc<Cache>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let args = match parse_storage_line(tokens, true) {
        Ok(a) => a,
        Err(e) => {
            let _ = write_line(writer, &e.text_line()).await;
            return;
        }
    };
    let value = match read_payload(reader, args.len).await {
        Ok(v) => v,
        Err(e) => {
            if !args.noreply {
                let _ = write_line(writer, &e.text_line()).await;
            }
            return;
        }
    };
    let result = cache
        .cas(args.key.into_bytes(), value, args.flags, args.ttl, args.cas.unwrap())
        .await;
    if args.noreply {
        return;
    }
    match result {
        Ok(_) => {
            let _ = write_line(writer, "STORED").await;
        }
        Err(e) => {
            let _ = write_line(writer, &e.text_line()).await;
        }
    }
}

async fn handle_delete<W: AsyncWrite + Unpin>(tokens: &[&str], writer: &mut W, cache: &Arc<Cache>) {
    let (tokens, noreply) = strip_noreply(tokens);
    if tokens.len() != 1 {
        if !noreply {
            let _ = write_line(writer, &CacheError::Malformed("bad command line format".into()).text_line()).await;
        }
        return;
    }
    let result = cache.delete(tokens[0].as_bytes()).await;
    if noreply {
        return;
    }
    match result {
        Ok(()) => {
            let _ = write_line(writer, "DELETED").await;
        }
        Err(e) => {
            let _ = write_line(writer, &e.text_line()).await;
        }
    }
}

async fn handle_arith<W: AsyncWrite + Unpin>(
    increment: bool,
    tokens: &[&str],
    writer: &mut W,
    cache: &Arc<Cache>,
) {
    let (tokens, noreply) = strip_noreply(tokens);
    if tokens.len() != 2 {
        if !noreply {
            let _ = write_line(writer, &CacheError::Malformed("bad command line format".into()).text_line()).await;
        }
        return;
    }
    let key = tokens[0];
    let delta: Result<u64, _> = tokens[1].parse();
    let delta = match delta {
        Ok(d) => d,
        Err(_) => {
            if !noreply {
                let _ = write_line(writer, &CacheError::Malformed("invalid numeric delta argument".into()).text_line()).await;
            }
            return;
        }
    };
    let result = if increment {
        cache.incr(key.as_bytes(), delta).await
    } else {
        cache.decr(key.as_bytes(), delta).await
    };
    if noreply {
        return;
    }
    match result {
        Ok((new_value, _cas)) => {
            let _ = write_line(writer, &new_value.to_string()).await;
        }
        Err(e) => {
            let _ = write_line(writer, &e.text_line()).await;
        }
    }
}

async fn handle_touch<W: AsyncWrite + Unpin>(tokens: &[&str], writer: &mut W, cache: &Arc<Cache>) {
    let (tokens, noreply) = strip_noreply(tokens);
    if tokens.len() != 2 {
        if !noreply {
            let _ = write_line(writer, &CacheError::Malformed("bad command line format".into()).text_line()).await;
        }
        return;
    }
    let key = tokens[0];
    let ttl: Result<i64, _> = tokens[1].parse();
    let ttl = match ttl {
        Ok(t) => t,
        Err(_) => {
            if !noreply {
                let _ = write_line(writer, &CacheError::Malformed("bad command line format".into()).text_line()).await;
            }
            return;
        }
    };
    let result = cache.touch(key.as_bytes(), ttl).await;
    if noreply {
        return;
    }
    match result {
        Ok(_) => {
            let _ = write_line(writer, "TOUCHED").await;
        }
        Err(e) => {
            let _ = write_line(writer, &e.text_line()).await;
        }
    }
}

async fn handle_flush_all<W: AsyncWrite + Unpin>(tokens: &[&str], writer: &mut W, cache: &Arc<Cache>) {
    let (_, noreply) = strip_noreply(tokens);
    cache.flush_all().await;
    if !noreply {
        let _ = write_line(writer, "OK").await;
    }
}

async fn handle_stats<W: AsyncWrite + Unpin>(writer: &mut W, cache: &Arc<Cache>) {
    for (key, value) in cache.stats().await {
        let _ = write_line(writer, &format!("STAT {key} {value}")).await;
    }
    let _ = write_line(writer, "END").await;
}
