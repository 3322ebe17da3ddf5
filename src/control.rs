//! Pool host control socket: newline-delimited JSON requests and responses.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::inspector::DetectOptions;
use crate::pool::{BufferService, CreateOptions};
use crate::pool_index::BufferedMeta;
use crate::process::RunningProject;

pub const CONTROL_SOCKET: &str = "control.sock";
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Request {
    Claim {
        #[serde(default)]
        target: Option<PathBuf>,
    },
    Seed {
        count: usize,
    },
    List,
    Running {
        dir: PathBuf,
    },
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Claimed { meta: BufferedMeta, hit: bool },
    Seeded { entries: Vec<BufferedMeta> },
    Entries { entries: Vec<BufferedMeta> },
    Running { projects: Vec<RunningProject> },
    Ok,
    Error { message: String },
}

impl Response {
    fn error(err: impl std::fmt::Display) -> Self {
        Response::Error {
            message: format!("{:#}", err),
        }
    }
}

pub fn control_socket_path(pool_root: &Path) -> PathBuf {
    pool_root.join(CONTROL_SOCKET)
}

pub async fn read_json_line_with_limit<R, T>(
    reader: &mut R,
    max_bytes: usize,
) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::new();
    let limit = max_bytes as u64 + 1;
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.len() > max_bytes {
        if buf.last() != Some(&b'\n') {
            discard_line(reader).await?;
        }
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("json line exceeds max length ({} > {})", buf.len(), max_bytes),
        ));
    }
    let line = std::str::from_utf8(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    serde_json::from_str::<T>(line)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Skips input up to and including the next newline without buffering it.
async fn discard_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|b| *b == b'\n') {
            Some(i) => {
                reader.consume(i + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

pub async fn write_json_line<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

/// Answers requests on one connection until the peer hangs up. Malformed lines get
/// `invalid_response` and the connection stays open.
pub async fn serve_jsonl_connection<Req, Resp, F, Fut, InvalidResp>(
    stream: UnixStream,
    handler: F,
    invalid_response: InvalidResp,
) -> std::io::Result<()>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: Fn(Req) -> Fut,
    Fut: Future<Output = Resp>,
    InvalidResp: Fn(std::io::Error) -> Resp,
{
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    loop {
        let request = match read_json_line_with_limit::<_, Req>(&mut reader, MAX_LINE_BYTES).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                let _ = write_json_line(&mut writer, &invalid_response(e)).await;
                continue;
            }
            Err(e) => return Err(e),
        };
        let response = handler(request).await;
        write_json_line(&mut writer, &response).await?;
    }
    Ok(())
}

async fn handle(service: BufferService, request: Request, rebind: mpsc::Sender<()>) -> Response {
    match request {
        Request::Claim { target } => {
            if let Some(target) = target.as_ref().filter(|t| t.is_relative()) {
                return Response::error(format!(
                    "claim target must be an absolute path: {}",
                    target.display()
                ));
            }
            let options = CreateOptions {
                target_dir: target,
                replenish: true,
            };
            match service.create(options).await {
                Ok(outcome) => Response::Claimed {
                    meta: outcome.meta,
                    hit: outcome.hit,
                },
                Err(err) => Response::error(err),
            }
        }
        Request::Seed { count } => match service.seed(count).await {
            Ok(entries) => Response::Seeded { entries },
            Err(err) => Response::error(err),
        },
        Request::List => Response::Entries {
            entries: service.entries().await,
        },
        Request::Running { dir } => Response::Running {
            projects: service.running_projects(&dir, DetectOptions::default()).await,
        },
        Request::Reset => match service.kill().await {
            Ok(()) => {
                // The socket file went away with the pool root.
                let _ = rebind.send(()).await;
                Response::Ok
            }
            Err(err) => Response::error(err),
        },
    }
}

async fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let _ = tokio::fs::remove_file(path).await;
    UnixListener::bind(path).with_context(|| format!("failed to bind {}", path.display()))
}

/// Serves the control socket until `cancel` fires.
pub async fn serve(service: BufferService, path: PathBuf, cancel: CancellationToken) -> Result<()> {
    let mut listener = bind(&path).await?;
    let (rebind_tx, mut rebind_rx) = mpsc::channel::<()>(1);
    tracing::info!(socket = %path.display(), "pool control socket listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(()) = rebind_rx.recv() => {
                listener = bind(&path).await?;
            }
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        tracing::debug!(error = %err, "control accept failed");
                        continue;
                    }
                };
                let service = service.clone();
                let rebind = rebind_tx.clone();
                tokio::spawn(async move {
                    let result = serve_jsonl_connection(
                        stream,
                        |request: Request| handle(service.clone(), request, rebind.clone()),
                        Response::error,
                    )
                    .await;
                    if let Err(err) = result {
                        tracing::debug!(error = %err, "control connection ended with error");
                    }
                });
            }
        }
    }

    let _ = tokio::fs::remove_file(&path).await;
    Ok(())
}

/// Sends one request to a running pool host and waits for its answer.
pub async fn send_request(path: &Path, request: &Request) -> Result<Response> {
    let stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("no pool host listening on {}", path.display()))?;
    let (reader, mut writer) = stream.into_split();
    write_json_line(&mut writer, request).await?;
    let mut reader = BufReader::new(reader);
    read_json_line_with_limit(&mut reader, MAX_LINE_BYTES)
        .await?
        .context("pool host closed the connection without answering")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolSettings, ProbeSettings, RelaySettings};
    use crate::inspector::Inspector;
    use crate::relay::RelayService;
    use std::time::Duration;

    #[tokio::test]
    async fn rejects_oversized_line() {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let (_ar, mut aw) = tokio::io::split(a);
        let (br, _bw) = tokio::io::split(b);
        let mut br = BufReader::new(br);

        aw.write_all("a".repeat(33).as_bytes()).await.unwrap();
        aw.write_all(b"\n").await.unwrap();
        let err = read_json_line_with_limit::<_, serde_json::Value>(&mut br, 32)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn oversized_line_is_skipped_without_buffering_it() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (_ar, mut aw) = tokio::io::split(a);
        let (br, _bw) = tokio::io::split(b);
        let mut br = BufReader::with_capacity(16, br);

        aw.write_all(format!("\"{}\"\n", "x".repeat(4096)).as_bytes())
            .await
            .unwrap();
        aw.write_all(b"{\"cmd\":\"list\"}\n").await.unwrap();
        let err = read_json_line_with_limit::<_, Request>(&mut br, 64)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("65 > 64"), "{}", err);
        let next = read_json_line_with_limit::<_, Request>(&mut br, 64)
            .await
            .unwrap();
        assert_eq!(next, Some(Request::List));
    }

    #[test]
    fn wire_format_uses_cmd_and_status_tags() {
        let request: Request = serde_json::from_str(r#"{"cmd":"claim"}"#).unwrap();
        assert_eq!(request, Request::Claim { target: None });
        let request: Request = serde_json::from_str(r#"{"cmd":"seed","count":2}"#).unwrap();
        assert_eq!(request, Request::Seed { count: 2 });
        assert_eq!(serde_json::to_string(&Response::Ok).unwrap(), r#"{"status":"ok"}"#);
        let error = serde_json::to_value(Response::error("boom")).unwrap();
        assert_eq!(error["status"], "error");
        assert_eq!(error["message"], "boom");
    }

    fn empty_pool(root: &Path) -> BufferService {
        let settings = PoolSettings {
            root: root.join("pool"),
            template: root.join("no-template"),
            size: 0,
            base_port: 5180,
            port_range: 10,
            package_manager: "pnpm".to_string(),
            scaffold: "true".to_string(),
            readiness_timeout: Duration::from_millis(100),
            scaffold_timeout: Duration::from_secs(5),
        };
        let relays = RelayService::new(Inspector::new().unwrap(), RelaySettings::default(), ProbeSettings::default());
        BufferService::new(relays, settings, ProbeSettings::default(), root.join("home"))
    }

    #[tokio::test]
    async fn serves_requests_and_survives_bad_json() {
        let tmp = tempfile::tempdir().unwrap();
        let service = empty_pool(tmp.path());
        let path = control_socket_path(&service.settings().root);
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(service, path.clone(), cancel.clone()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while !path.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let stream = UnixStream::connect(&path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        writer.write_all(b"{not json}\n").await.unwrap();
        let response: Response = read_json_line_with_limit(&mut reader, MAX_LINE_BYTES)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(response, Response::Error { .. }));

        write_json_line(&mut writer, &Request::List).await.unwrap();
        let response: Response = read_json_line_with_limit(&mut reader, MAX_LINE_BYTES)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, Response::Entries { entries: Vec::new() });
        drop(writer);

        let response = send_request(
            &path,
            &Request::Claim {
                target: Some(PathBuf::from("relative/app")),
            },
        )
        .await
        .unwrap();
        match response {
            Response::Error { message } => assert!(message.contains("absolute"), "{}", message),
            other => panic!("unexpected response {:?}", other),
        }
        assert!(!Path::new("relative").exists());

        // No template, so an on-demand claim cannot succeed.
        let response = send_request(&path, &Request::Claim { target: None }).await.unwrap();
        assert!(matches!(response, Response::Error { .. }));

        let response = send_request(&path, &Request::Reset).await.unwrap();
        assert_eq!(response, Response::Ok);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !path.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let response = send_request(&path, &Request::List).await.unwrap();
        assert_eq!(response, Response::Entries { entries: Vec::new() });

        cancel.cancel();
        server.await.unwrap().unwrap();
        assert!(!path.exists());
    }
}
