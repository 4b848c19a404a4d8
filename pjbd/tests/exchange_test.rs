//! Full request/response exchanges through the pool.

mod common;

use common::{echo_script, spawn_responder, Reply, Responder, Script};
use pjbd::error::ConnectionErrorKind;
use pjbd::fastcgi::{decode_stream, read_record, FCGI_PARAMS, FCGI_STDIN};
use pjbd::{run_exchange, ChannelFactory, ConnectionPool, ExchangeError, PoolSettings};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

async fn pool_for(responder: &Responder) -> ConnectionPool {
    let factory = Arc::new(ChannelFactory::from_config(&responder.config()));
    ConnectionPool::new(factory, PoolSettings::from_config(&responder.config()))
        .await
        .unwrap()
}

fn script_params(script: &str, method: &str) -> Vec<(String, String)> {
    vec![
        ("REQUEST_METHOD".to_string(), method.to_string()),
        ("SCRIPT_FILENAME".to_string(), script.to_string()),
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
    ]
}

#[tokio::test]
async fn get_request_returns_headers_and_body() {
    let responder = spawn_responder(echo_script()).await;
    let pool = pool_for(&responder).await;

    let mut body: &[u8] = &[];
    let mut sink = Vec::new();
    let outcome = run_exchange(
        &pool,
        script_params("/srv/www/index.php", "GET"),
        &mut body,
        &mut sink,
    )
    .await
    .unwrap();

    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.header("content-type"), Some("text/plain"));
    assert_eq!(sink, b"GET /srv/www/index.php\n");
    assert_eq!(outcome.body_len, sink.len() as u64);
    assert_eq!(outcome.end.app_status, 0);
    assert!(outcome.check_error().is_ok());
    assert_eq!(pool.idle(), 1);
}

#[tokio::test]
async fn large_body_crosses_record_boundaries() {
    let responder = spawn_responder(echo_script()).await;
    let pool = pool_for(&responder).await;

    let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    let mut body = payload.as_slice();
    let mut sink = Vec::new();
    let outcome = run_exchange(
        &pool,
        script_params("/srv/www/upload.php", "POST"),
        &mut body,
        &mut sink,
    )
    .await
    .unwrap();

    let prefix = b"POST /srv/www/upload.php\n";
    assert_eq!(&sink[..prefix.len()], prefix);
    assert_eq!(&sink[prefix.len()..], payload.as_slice());
    assert_eq!(outcome.body_len as usize, prefix.len() + payload.len());
}

#[tokio::test]
async fn empty_params_never_reach_the_worker() {
    let script: Script = Arc::new(|params: &HashMap<String, String>, _: &[u8]| {
        let mut keys: Vec<_> = params.keys().cloned().collect();
        keys.sort();
        Reply::cgi("Status: 404 Not Found", keys.join(",").as_bytes())
    });
    let responder = spawn_responder(script).await;
    let pool = pool_for(&responder).await;

    let params = vec![
        ("SCRIPT_FILENAME", "/srv/www/missing.php"),
        ("QUERY_STRING", ""),
        ("", "orphan-value"),
        ("REQUEST_METHOD", "GET"),
    ];
    let mut body: &[u8] = &[];
    let mut sink = Vec::new();
    let outcome = run_exchange(&pool, params, &mut body, &mut sink).await.unwrap();

    assert_eq!(outcome.status, 404);
    assert_eq!(sink, b"REQUEST_METHOD,SCRIPT_FILENAME");
}

#[tokio::test]
async fn php_fatal_error_is_reported_after_release() {
    let script: Script = Arc::new(|_: &HashMap<String, String>, _: &[u8]| Reply {
        stderr: b"PHP Fatal error:  Uncaught Error: Call to undefined function foo()\n".to_vec(),
        app_status: 255,
        ..Reply::cgi("Status: 500 Internal Server Error", b"")
    });
    let responder = spawn_responder(script).await;
    let pool = pool_for(&responder).await;

    let mut body: &[u8] = &[];
    let mut sink = Vec::new();
    let outcome = run_exchange(&pool, script_params("/srv/a.php", "GET"), &mut body, &mut sink)
        .await
        .unwrap();
    assert_eq!(outcome.status, 500);
    assert_eq!(outcome.end.app_status, 255);
    assert!(outcome.php_error().unwrap().contains("undefined function foo()"));
    assert!(matches!(outcome.check_error(), Err(ExchangeError::Php(_))));

    // The connection went back clean and serves the next request.
    assert_eq!(pool.idle(), 1);
    let accepts = responder.accepts();
    run_exchange(&pool, script_params("/srv/a.php", "GET"), &mut body, &mut sink)
        .await
        .unwrap();
    assert_eq!(responder.accepts(), accepts);
    assert_eq!(responder.requests(), 2);
}

#[tokio::test]
async fn truncated_response_closes_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                // Probe connections close without sending anything.
                if read_record(&mut stream).await.ok().flatten().is_none() {
                    return;
                }
                decode_stream(&mut stream, FCGI_PARAMS).await.unwrap();
                decode_stream(&mut stream, FCGI_STDIN).await.unwrap();
                // Half a record header, then hang up.
                stream.write_all(&[1, 6, 0]).await.unwrap();
                stream.shutdown().await.unwrap();
            });
        }
    });

    let config = pjb_core::config::FastCgiConfig {
        port: addr.port(),
        select_port: false,
        ..Default::default()
    };
    let factory = Arc::new(ChannelFactory::from_config(&config));
    let pool = ConnectionPool::new(factory, PoolSettings::from_config(&config))
        .await
        .unwrap();

    let mut body: &[u8] = &[];
    let mut sink = Vec::new();
    let err = run_exchange(&pool, script_params("/srv/a.php", "GET"), &mut body, &mut sink)
        .await
        .unwrap_err();
    match err {
        ExchangeError::Connection(e) => assert_eq!(e.kind(), ConnectionErrorKind::Protocol),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(pool.idle(), 1);
    assert_eq!(pool.outstanding(), 0);
}
