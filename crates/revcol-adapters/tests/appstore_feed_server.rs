use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use revcol_adapters::{AppStoreFeedSource, CountryFetcher, CountryRequest, FetchSettings};
use revcol_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn fixture(rel: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(rel);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
}

fn page_number(request_line: &str) -> u32 {
    request_line
        .split("page=")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

async fn respond(mut stream: TcpStream, pages: Arc<Vec<String>>, empty: Arc<String>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let head = String::from_utf8_lossy(&buf);
    let page = page_number(head.lines().next().unwrap_or_default());
    let body = match page {
        1 | 2 => pages[page as usize - 1].as_str(),
        3..=5 => empty.as_str(),
        // reviews beyond the empty run must never be requested
        _ => pages[0].as_str(),
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/xml\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await.unwrap();
    stream.shutdown().await.ok();
}

async fn serve_feed(requests: Arc<AtomicUsize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let pages = Arc::new(vec![
        fixture("appstore/us_page1.xml"),
        fixture("appstore/us_page2.xml"),
    ]);
    let empty = Arc::new(fixture("appstore/empty_page.xml"));
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            requests.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(respond(stream, pages.clone(), empty.clone()));
        }
    });
    format!("http://{addr}/{{country}}/rss/customerreviews/page={{page}}/id={{app_id}}/xml")
}

#[tokio::test]
async fn appstore_country_survives_empty_pages_until_the_third() {
    let requests = Arc::new(AtomicUsize::new(0));
    let template = serve_feed(requests.clone()).await;

    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    let source = Arc::new(AppStoreFeedSource::with_template(http, template));
    let settings = FetchSettings {
        min_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        backoff: BackoffPolicy {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        empty_page_limit: 3,
    };
    let fetcher = CountryFetcher::new(source, settings);

    let result = fetcher
        .fetch_country(&CountryRequest {
            app_id: "284882215".to_string(),
            country: "us".to_string(),
            max_pages: 10,
            max_retries_per_page: 3,
            geo_scope: Some("us".to_string()),
        })
        .await
        .unwrap();

    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!(result.pages_processed, 5);
    assert_eq!(requests.load(Ordering::SeqCst), 5);
    // two valid entries on page 1, three on page 2
    assert_eq!(result.reviews.len(), 5);
    assert_eq!(result.reviews[2].source_id, "10987654324");
}
