//! Wall-clock check that script fetches gather concurrently.
//!
//! A fixture server delays every response by a fixed interval; fetching
//! K bodies must cost about one interval, not K of them.

use std::time::{Duration, Instant};

use adscrape::fetch::{DirectFetcher, FetchContext};
use futures::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const DELAY: Duration = Duration::from_millis(300);
const URL_COUNT: usize = 4;

/// Minimal HTTP server answering every request with a delayed body.
async fn fixture_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fixture server");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                tokio::time::sleep(DELAY).await;
                let body = "var delayed = true;";
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/javascript\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn gathered_fetches_cost_one_delay_not_k() {
    let base = fixture_server().await;
    let fetcher = FetchContext::Direct(
        DirectFetcher::new("parallel-test", &[], Duration::from_secs(10))
            .expect("client should build"),
    );

    let urls: Vec<String> = (0..URL_COUNT)
        .map(|i| format!("{base}/v1/script-{i}.js?fletch-render-{i}"))
        .collect();

    let started = Instant::now();
    let bodies = join_all(urls.iter().map(|url| {
        let fetcher = fetcher.clone();
        async move { fetcher.fetch_text(url).await }
    }))
    .await;
    let elapsed = started.elapsed();

    for body in bodies {
        assert_eq!(body.expect("fetch should succeed"), "var delayed = true;");
    }

    // Serial execution would take URL_COUNT * DELAY (1200ms). Allow 1.5x
    // a single delay plus scheduling slack.
    let budget = DELAY.mul_f32(1.5) + Duration::from_millis(200);
    assert!(
        elapsed < budget,
        "expected gathered fetches within {budget:?}, took {elapsed:?}"
    );
}
