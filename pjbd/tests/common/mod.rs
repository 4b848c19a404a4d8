//! In-process FastCGI responder standing in for php-cgi.

#![allow(dead_code)]

use pjb_core::config::FastCgiConfig;
use pjbd::fastcgi::{
    decode_name_values, decode_stream, read_record, write_record, write_stream, EndRequest,
    FCGI_BEGIN_REQUEST, FCGI_END_REQUEST, FCGI_PARAMS, FCGI_REQUEST_COMPLETE, FCGI_STDERR,
    FCGI_STDIN, FCGI_STDOUT,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub app_status: u32,
}

impl Reply {
    pub fn cgi(headers: &str, body: &[u8]) -> Self {
        let mut stdout = headers.as_bytes().to_vec();
        stdout.extend_from_slice(b"\r\n\r\n");
        stdout.extend_from_slice(body);
        Self {
            stdout,
            ..Self::default()
        }
    }
}

pub type Script = Arc<dyn Fn(&HashMap<String, String>, &[u8]) -> Reply + Send + Sync>;

pub struct Responder {
    pub addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Responder {
    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Pool configuration pointing at this responder, no worker of our own.
    pub fn config(&self) -> FastCgiConfig {
        FastCgiConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            select_port: false,
            ..FastCgiConfig::default()
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Echoes `REQUEST_METHOD`, `SCRIPT_FILENAME` and the request body.
pub fn echo_script() -> Script {
    Arc::new(|params: &HashMap<String, String>, stdin: &[u8]| {
        let mut body = format!(
            "{} {}\n",
            params.get("REQUEST_METHOD").map(String::as_str).unwrap_or("-"),
            params.get("SCRIPT_FILENAME").map(String::as_str).unwrap_or("-"),
        )
        .into_bytes();
        body.extend_from_slice(stdin);
        Reply::cgi("Content-Type: text/plain", &body)
    })
}

pub async fn spawn_responder(script: Script) -> Responder {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));
    let task = {
        let accepts = accepts.clone();
        let requests = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accepts.fetch_add(1, Ordering::SeqCst);
                let script = script.clone();
                let requests = requests.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, script, requests).await;
                });
            }
        })
    };
    Responder {
        addr,
        accepts,
        requests,
        task,
    }
}

async fn serve(
    mut stream: TcpStream,
    script: Script,
    requests: Arc<AtomicUsize>,
) -> Result<(), pjbd::fastcgi::FrameError> {
    loop {
        let Some(begin) = read_record(&mut stream).await? else {
            return Ok(());
        };
        assert_eq!(begin.record_type(), FCGI_BEGIN_REQUEST);
        assert_eq!(begin.header.request_id, 1);
        let params = decode_stream(&mut stream, FCGI_PARAMS).await?;
        let params = decode_name_values(&params)?;
        let stdin = decode_stream(&mut stream, FCGI_STDIN).await?;
        requests.fetch_add(1, Ordering::SeqCst);

        let reply = script(&params, &stdin);
        if !reply.stderr.is_empty() {
            write_stream(&mut stream, FCGI_STDERR, &reply.stderr).await?;
        }
        write_stream(&mut stream, FCGI_STDOUT, &reply.stdout).await?;
        let end = EndRequest {
            app_status: reply.app_status,
            protocol_status: FCGI_REQUEST_COMPLETE,
        };
        write_record(&mut stream, FCGI_END_REQUEST, &end.encode()).await?;
        stream.flush().await?;
    }
}
