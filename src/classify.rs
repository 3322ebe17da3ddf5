//! Dev server fingerprinting over HTTP.
//!
//! Each probe is independent and short-lived; a probe that errors or times out casts
//! no vote. Votes are combined with a fixed precedence.

use std::time::Duration;

use reqwest::header::HeaderMap;
use tokio::net::TcpStream;

use crate::process::DevServerKind;

const VITE_CLIENT_MARKERS: &[&str] = &["createHotContext", "vite/dist/client", "__HMR_CONFIG_NAME__"];
const WEBPACK_MARKERS: &[&str] = &["webpack-dev-server", "Webpack Dev Server", "webpack/hot"];
const NEXT_ROOT_MARKERS: &[&str] = &["__NEXT_DATA__", "/_next/static", "next-route-announcer"];

/// `localhost` may resolve to either family, so both loopbacks are tried in order.
const LOOPBACK_HOSTS: &[&str] = &["127.0.0.1", "[::1]"];

/// Which build tools the probes found evidence for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Votes {
    pub vite: bool,
    pub next: bool,
    pub webpack: bool,
}

impl Votes {
    /// Precedence: vite > next > webpack-dev-server > unknown.
    pub fn decide(self) -> DevServerKind {
        if self.vite {
            DevServerKind::Vite
        } else if self.next {
            DevServerKind::Next
        } else if self.webpack {
            DevServerKind::WebpackDevServer
        } else {
            DevServerKind::Unknown
        }
    }
}

/// Validates a port number from an untyped source.
pub fn valid_port(port: i64) -> Option<u16> {
    if port <= 0 || port > i64::from(u16::MAX) {
        return None;
    }
    u16::try_from(port).ok()
}

/// Parses a port from user input; non-numeric, non-finite and out-of-range values yield None.
pub fn parse_port(raw: &str) -> Option<u16> {
    let value: f64 = raw.trim().parse().ok()?;
    if !value.is_finite() || value.fract() != 0.0 {
        return None;
    }
    valid_port(value as i64)
}

struct Probe {
    status: u16,
    headers: HeaderMap,
    body: String,
}

async fn fetch(client: &reqwest::Client, url: String, timeout: Duration) -> Option<Probe> {
    let request = async {
        let response = client.get(&url).send().await.ok()?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Some(Probe {
            status,
            headers,
            body,
        })
    };
    tokio::time::timeout(timeout, request).await.ok().flatten()
}

fn has_next_header(headers: &HeaderMap) -> bool {
    let powered_by_next = headers
        .get("x-powered-by")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("Next.js"))
        .unwrap_or(false);
    powered_by_next
        || headers
            .keys()
            .any(|name| name.as_str().starts_with("x-nextjs-"))
}

fn contains_any(body: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| body.contains(m))
}

/// Base URL of the first loopback address accepting TCP connections on `port`.
pub async fn loopback_base(port: u16, timeout: Duration) -> Option<String> {
    for host in LOOPBACK_HOSTS {
        let addr = format!("{}:{}", host, port);
        if let Ok(Ok(_)) = tokio::time::timeout(timeout, TcpStream::connect(addr.as_str())).await {
            return Some(format!("http://{}", addr));
        }
    }
    None
}

/// Classifies the dev server on the loopback `port`.
pub async fn classify(client: &reqwest::Client, port: u16, timeout: Duration) -> DevServerKind {
    let Some(base) = loopback_base(port, timeout).await else {
        return DevServerKind::Unknown;
    };
    let (vite_client, webpack, next_hmr, root) = tokio::join!(
        fetch(client, format!("{}/@vite/client", base), timeout),
        fetch(client, format!("{}/webpack-dev-server", base), timeout),
        fetch(client, format!("{}/_next/webpack-hmr", base), timeout),
        fetch(client, format!("{}/", base), timeout),
    );

    let mut votes = Votes::default();
    if let Some(probe) = vite_client {
        votes.vite |= probe.status == 200 && contains_any(&probe.body, VITE_CLIENT_MARKERS);
    }
    if let Some(probe) = webpack {
        votes.webpack |= probe.status == 200 && contains_any(&probe.body, WEBPACK_MARKERS);
    }
    if let Some(probe) = next_hmr {
        votes.next |= matches!(probe.status, 200 | 404) && has_next_header(&probe.headers);
    }
    if let Some(probe) = root {
        votes.next |= has_next_header(&probe.headers) || contains_any(&probe.body, NEXT_ROOT_MARKERS);
        votes.vite |= probe.body.contains("/@vite/client");
    }
    votes.decide()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Canned {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static str,
    }

    async fn serve(routes: HashMap<&'static str, Canned>, hang: bool) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        serve_on(listener, routes, hang)
    }

    /// Serves canned responses by path; unknown paths get 404, `hang` paths never answer.
    fn serve_on(listener: TcpListener, routes: HashMap<&'static str, Canned>, hang: bool) -> u16 {
        let port = listener.local_addr().unwrap().port();
        let routes = Arc::new(routes);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    if hang {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        return;
                    }
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status, headers, body) = match routes.get(path.as_str()) {
                        Some(c) => (c.status, c.headers.clone(), c.body),
                        None => (404, Vec::new(), "not found"),
                    };
                    let mut response = format!(
                        "HTTP/1.1 {} X\r\ncontent-length: {}\r\nconnection: close\r\n",
                        status,
                        body.len()
                    );
                    for (k, v) in headers {
                        response.push_str(&format!("{}: {}\r\n", k, v));
                    }
                    response.push_str("\r\n");
                    response.push_str(body);
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        port
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[test]
    fn precedence_prefers_vite_then_next_then_webpack() {
        let all = Votes {
            vite: true,
            next: true,
            webpack: true,
        };
        assert_eq!(all.decide(), DevServerKind::Vite);
        let next_webpack = Votes {
            vite: false,
            next: true,
            webpack: true,
        };
        assert_eq!(next_webpack.decide(), DevServerKind::Next);
        let webpack = Votes {
            webpack: true,
            ..Votes::default()
        };
        assert_eq!(webpack.decide(), DevServerKind::WebpackDevServer);
        assert_eq!(Votes::default().decide(), DevServerKind::Unknown);
    }

    #[test]
    fn rejects_invalid_ports() {
        assert_eq!(valid_port(0), None);
        assert_eq!(valid_port(-1), None);
        assert_eq!(valid_port(70000), None);
        assert_eq!(valid_port(5173), Some(5173));
        assert_eq!(parse_port("NaN"), None);
        assert_eq!(parse_port("inf"), None);
        assert_eq!(parse_port("3000.5"), None);
        assert_eq!(parse_port("3000"), Some(3000));
    }

    #[tokio::test]
    async fn vite_wins_over_next_markers() {
        let mut routes = HashMap::new();
        routes.insert(
            "/@vite/client",
            Canned {
                status: 200,
                headers: Vec::new(),
                body: "import { createHotContext } from 'x'",
            },
        );
        routes.insert(
            "/",
            Canned {
                status: 200,
                headers: vec![("x-powered-by", "Next.js")],
                body: "<html></html>",
            },
        );
        let port = serve(routes, false).await;
        assert_eq!(
            classify(&client(), port, Duration::from_secs(2)).await,
            DevServerKind::Vite
        );
    }

    #[tokio::test]
    async fn next_marker_alone_is_next() {
        let mut routes = HashMap::new();
        routes.insert(
            "/",
            Canned {
                status: 200,
                headers: Vec::new(),
                body: "<script id=\"__NEXT_DATA__\">{}</script>",
            },
        );
        let port = serve(routes, false).await;
        assert_eq!(
            classify(&client(), port, Duration::from_secs(2)).await,
            DevServerKind::Next
        );
    }

    #[tokio::test]
    async fn webpack_page_is_detected() {
        let mut routes = HashMap::new();
        routes.insert(
            "/webpack-dev-server",
            Canned {
                status: 200,
                headers: Vec::new(),
                body: "<h1>Webpack Dev Server</h1>",
            },
        );
        let port = serve(routes, false).await;
        assert_eq!(
            classify(&client(), port, Duration::from_secs(2)).await,
            DevServerKind::WebpackDevServer
        );
    }

    #[tokio::test]
    async fn no_markers_is_unknown() {
        let port = serve(HashMap::new(), false).await;
        assert_eq!(
            classify(&client(), port, Duration::from_secs(2)).await,
            DevServerKind::Unknown
        );
    }

    #[tokio::test]
    async fn hung_probes_time_out_to_unknown() {
        let port = serve(HashMap::new(), true).await;
        let started = std::time::Instant::now();
        assert_eq!(
            classify(&client(), port, Duration::from_millis(200)).await,
            DevServerKind::Unknown
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn ipv6_only_vite_is_detected() {
        // Hosts without IPv6 loopback cannot run this.
        let Ok(listener) = TcpListener::bind("[::1]:0").await else {
            return;
        };
        let mut routes = HashMap::new();
        routes.insert(
            "/@vite/client",
            Canned {
                status: 200,
                headers: Vec::new(),
                body: "import { createHotContext } from 'x'",
            },
        );
        let port = serve_on(listener, routes, false);
        assert_eq!(
            loopback_base(port, Duration::from_secs(1)).await,
            Some(format!("http://[::1]:{}", port))
        );
        assert_eq!(
            classify(&client(), port, Duration::from_secs(2)).await,
            DevServerKind::Vite
        );
    }

    #[tokio::test]
    async fn closed_port_has_no_loopback_base() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);
        assert_eq!(loopback_base(port, Duration::from_millis(200)).await, None);
    }
}
