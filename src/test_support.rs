//! Local TCP/TLS servers for socket-level tests.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::Endpoint;

/// What the server does on each accepted connection.
#[derive(Clone, Debug)]
pub(crate) enum Script {
    /// Answer every request with these pieces (written with a short pause
    /// between them) and keep the connection open.
    Respond(Vec<Vec<u8>>),
    /// Answer the first request with these bytes, then go silent.
    Stall(Vec<u8>),
    /// Answer the first request with these bytes, then close.
    Close(Vec<u8>),
    /// Write these bytes as soon as the connection opens.
    Greet(Vec<u8>),
}

pub(crate) struct TestServer {
    pub endpoint: Endpoint,
    pub accepted: Arc<AtomicUsize>,
    pub requests: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Let the accept loop catch up, then report the accept count.
    ///
    /// Waits until at least `expected` connections were accepted (or two
    /// seconds pass), then settles briefly so surplus accepts show up too.
    pub async fn wait_accepted(&self, expected: usize) -> usize {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.accepted() < expected && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.accepted()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Self-signed acceptor for `localhost`.
pub(crate) fn self_signed_acceptor() -> TlsAcceptor {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let der = cert.serialize_der().unwrap();
    let key = cert.serialize_private_key_der();
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![Certificate(der)], PrivateKey(key))
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// A `200 OK` response with a length-framed body.
pub(crate) fn ok_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

/// A trace document as the edge would serve it.
pub(crate) fn trace_body(ip: &str, colo: &str) -> String {
    format!("fl=12f1\nh=speed.cloudflare.com\nip={ip}\nts=1700000000.1\nvisit_scheme=https\ncolo={colo}\nhttp=http/1.1\ntls=TLSv1.3\n")
}

pub(crate) async fn spawn_server(script: Script, tls: bool) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));
    let acceptor = tls.then(self_signed_acceptor);

    let accepted_c = accepted.clone();
    let requests_c = requests.clone();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                return;
            };
            accepted_c.fetch_add(1, Ordering::SeqCst);
            let script = script.clone();
            let requests = requests_c.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => {
                        if let Ok(tls) = acceptor.accept(sock).await {
                            run_script(tls, script, requests).await;
                        }
                    }
                    None => run_script(sock, script, requests).await,
                }
            });
        }
    });

    TestServer {
        endpoint: Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        accepted,
        requests,
        handle,
    }
}

async fn run_script<S>(mut stream: S, script: Script, requests: Arc<AtomicUsize>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Script::Greet(bytes) = &script {
        let _ = stream.write_all(bytes).await;
        let _ = stream.flush().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        return;
    }

    loop {
        if !read_request(&mut stream).await {
            return;
        }
        requests.fetch_add(1, Ordering::SeqCst);
        match &script {
            Script::Respond(pieces) => {
                for piece in pieces {
                    if stream.write_all(piece).await.is_err() {
                        return;
                    }
                    let _ = stream.flush().await;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            Script::Stall(bytes) => {
                let _ = stream.write_all(bytes).await;
                let _ = stream.flush().await;
                tokio::time::sleep(Duration::from_secs(30)).await;
                return;
            }
            Script::Close(bytes) => {
                let _ = stream.write_all(bytes).await;
                let _ = stream.shutdown().await;
                return;
            }
            Script::Greet(_) => return,
        }
    }
}

/// Read one request head. Returns false on EOF or error.
async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> bool {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    return true;
                }
            }
        }
    }
}
