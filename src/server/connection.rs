//! Per-connection handling: protocol detection followed by dispatch to the
//! matching codec.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::timeout;
use tracing::debug;

use crate::cache::Cache;
use crate::protocol::{binary, text, BINARY_REQUEST_MAGIC};

const PROTOCOL_DETECT_DEADLINE: Duration = Duration::from_secs(5);

/// Serves one accepted connection to completion. Panics inside the codec
/// dispatch are caught by the task boundary the caller spawned this
/// future on; they close only this connection.
pub async fn handle<S>(stream: S, cache: Arc<Cache>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, write_half) = split(stream);

    let mut first_byte = [0u8; 1];
    let read = timeout(PROTOCOL_DETECT_DEADLINE, read_half.read_exact(&mut first_byte)).await;
    let n = match read {
        Ok(Ok(n)) => n,
        Ok(Err(_)) | Err(_) => {
            debug!("connection closed before protocol detection");
            return;
        }
    };
    if n == 0 {
        return;
    }

    // Prepend the already-consumed byte back onto the stream so the codec
    // sees an unbroken frame.
    let reader = Cursor::new(first_byte).chain(read_half);

    if first_byte[0] == BINARY_REQUEST_MAGIC {
        binary::serve(reader, write_half, cache).await;
    } else {
        text::serve(reader, write_half, cache).await;
    }
}
