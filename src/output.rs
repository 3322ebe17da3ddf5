//! Output chunks relayed from dev servers.
//!
//! Chunks are forwarded verbatim (ANSI colour included) to socket clients; display
//! sanitization is left to the consumer.

use bytes::Bytes;
use strip_ansi_escapes::strip;
use tokio::io::AsyncWriteExt;

/// Indicates the source stream of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// Raw bytes read from one of the child's streams.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: Bytes,
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(data: &[u8], strip_ansi: bool) -> String {
    if !strip_ansi {
        return String::from_utf8_lossy(data).to_string();
    }
    let stripped = strip(data);
    String::from_utf8_lossy(&stripped).to_string()
}

/// Mirrors a chunk onto the host's own stdout or stderr.
pub async fn echo_chunk(chunk: &OutputChunk) {
    let result = match chunk.stream {
        StreamKind::Stdout => {
            let mut out = tokio::io::stdout();
            match out.write_all(&chunk.data).await {
                Ok(()) => out.flush().await,
                Err(err) => Err(err),
            }
        }
        StreamKind::Stderr => {
            let mut err_out = tokio::io::stderr();
            match err_out.write_all(&chunk.data).await {
                Ok(()) => err_out.flush().await,
                Err(err) => Err(err),
            }
        }
    };
    if let Err(err) = result {
        tracing::debug!(error = %err, "failed to echo dev server output");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_colour_codes_on_request() {
        let raw = b"\x1b[32mready\x1b[0m in 120ms";
        assert_eq!(sanitize_text(raw, true), "ready in 120ms");
        assert_eq!(sanitize_text(raw, false), "\u{1b}[32mready\u{1b}[0m in 120ms");
    }

    #[test]
    fn sanitize_replaces_invalid_utf8() {
        assert_eq!(sanitize_text(&[0x66, 0xff, 0x6f], false), "f\u{fffd}o");
    }

    #[tokio::test]
    async fn echo_writes_both_streams() {
        for stream in [StreamKind::Stdout, StreamKind::Stderr] {
            let chunk = OutputChunk {
                stream,
                data: Bytes::from_static(b""),
            };
            echo_chunk(&chunk).await;
        }
    }
}
