//! Fetch contexts for script bodies and RPC replays
//!
//! Two implementations behind one seam: `BrowserFetcher` issues fetches
//! from inside the page (cookies attach automatically, traffic traverses
//! the context's proxy), and `DirectFetcher` is a reqwest client built
//! once per session with the browser's cookies and user agent mirrored,
//! explicitly bypassing any system proxy. Partial-proxy mode routes
//! unauthenticated CDN scripts through the direct client; everything
//! authenticated stays in the browser.

use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::Page;

/// Cookie snapshot harvested from the browser context.
#[derive(Debug, Clone)]
pub struct CookiePair {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

/// Body plus the cache-relevant response headers.
#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Proxy-bypassing HTTP client sharing the session's identity.
///
/// Built once at session open (before any cookies exist) and mirrored
/// with the browser's cookies after the head-of-batch harvest.
#[derive(Clone)]
pub struct DirectFetcher {
    client: reqwest::Client,
    jar: Arc<reqwest::cookie::Jar>,
}

impl DirectFetcher {
    /// Build the client once per session; it is dropped at session close.
    pub fn new(user_agent: &str, cookies: &[CookiePair], timeout: Duration) -> Result<Self> {
        let jar = Arc::new(reqwest::cookie::Jar::default());

        // gzip/brotli/deflate support makes the client advertise
        // `accept-encoding: gzip, br, deflate` on every request and
        // decompress transparently; setting the header by hand would
        // turn the decompression off.
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .cookie_provider(jar.clone())
            .no_proxy()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .timeout(timeout)
            .build()
            .context("building direct HTTP client")?;
        let fetcher = Self { client, jar };
        fetcher.add_cookies(cookies);
        Ok(fetcher)
    }

    /// Mirror browser cookies into the client's jar.
    pub fn add_cookies(&self, cookies: &[CookiePair]) {
        for cookie in cookies {
            let origin = format!("https://{}/", cookie.domain.trim_start_matches('.'));
            let Ok(url) = reqwest::Url::parse(&origin) else {
                continue;
            };
            self.jar.add_cookie_str(
                &format!(
                    "{}={}; Domain={}; Path={}",
                    cookie.name, cookie.value, cookie.domain, cookie.path
                ),
                &url,
            );
        }
    }

    /// Fetch a body with its cache-relevant headers.
    pub async fn fetch_artifact(&self, url: &str) -> Result<FetchedArtifact> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("direct fetch of {url}"))?;
        if !response.status().is_success() {
            return Err(anyhow!("direct fetch of {url} returned {}", response.status()));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header("content-type");
        let etag = header("etag").map(|v| v.trim_start_matches("W/").trim_matches('"').to_string());
        let last_modified = header("last-modified");

        let body = response
            .bytes()
            .await
            .with_context(|| format!("reading body of {url}"))?
            .to_vec();
        Ok(FetchedArtifact {
            body,
            content_type,
            etag,
            last_modified,
        })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        let artifact = self.fetch_artifact(url).await?;
        Ok(String::from_utf8_lossy(&artifact.body).into_owned())
    }
}

/// Fetcher that runs inside the page, so the context's cookies and proxy
/// apply without mirroring.
#[derive(Clone)]
pub struct BrowserFetcher {
    page: Arc<Page>,
}

impl BrowserFetcher {
    #[must_use]
    pub fn new(page: Arc<Page>) -> Self {
        Self { page }
    }

    /// GET a text body from inside the page.
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        let url_literal = serde_json::to_string(url).context("encoding fetch URL")?;
        let script = format!(
            r#"(async () => {{
                const resp = await fetch({url_literal}, {{ credentials: "include" }});
                if (!resp.ok) {{ throw new Error("HTTP " + resp.status + " fetching script"); }}
                return await resp.text();
            }})()"#
        );
        let result = self
            .page
            .evaluate(script)
            .await
            .with_context(|| format!("browser fetch of {url}"))?;
        result
            .into_value::<String>()
            .with_context(|| format!("reading browser fetch result for {url}"))
    }

    /// POST a form body from inside the page; origin is set by the
    /// browser, the referrer comes from the fetch init.
    pub async fn post_form(
        &self,
        url: &str,
        body: &str,
        referer: &str,
        extra_headers: &[(String, String)],
    ) -> Result<String> {
        let url_literal = serde_json::to_string(url).context("encoding POST URL")?;
        let body_literal = serde_json::to_string(body).context("encoding POST body")?;
        let referer_literal = serde_json::to_string(referer).context("encoding referrer")?;
        let headers_literal = serde_json::to_string(
            &extra_headers
                .iter()
                .filter(|(name, _)| {
                    // The browser refuses forbidden headers in fetch();
                    // it sets these itself.
                    !matches!(name.as_str(), "origin" | "referer" | "accept-encoding")
                })
                .cloned()
                .collect::<std::collections::BTreeMap<_, _>>(),
        )
        .context("encoding POST headers")?;

        let script = format!(
            r#"(async () => {{
                const resp = await fetch({url_literal}, {{
                    method: "POST",
                    credentials: "include",
                    referrer: {referer_literal},
                    headers: {headers_literal},
                    body: {body_literal}
                }});
                if (!resp.ok) {{ throw new Error("HTTP " + resp.status + " from RPC"); }}
                return await resp.text();
            }})()"#
        );
        let result = self
            .page
            .evaluate(script)
            .await
            .with_context(|| format!("browser POST to {url}"))?;
        result
            .into_value::<String>()
            .with_context(|| format!("reading RPC response from {url}"))
    }
}

/// The session's script-fetch seam: proxied via browser, or direct.
#[derive(Clone)]
pub enum FetchContext {
    Direct(DirectFetcher),
    Browser(BrowserFetcher),
}

impl FetchContext {
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        match self {
            Self::Direct(client) => client.fetch_text(url).await,
            Self::Browser(fetcher) => fetcher.fetch_text(url).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn direct_fetch_captures_cache_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/app.js")
            .with_status(200)
            .with_header("content-type", "text/javascript")
            .with_header("etag", "W/\"abc123\"")
            .with_header("last-modified", "Tue, 01 Jul 2025 10:00:00 GMT")
            .with_body("var x = 1;")
            .create_async()
            .await;

        let fetcher = DirectFetcher::new("test-agent", &[], Duration::from_secs(5))
            .expect("client should build");
        let artifact = fetcher
            .fetch_artifact(&format!("{}/v1/app.js", server.url()))
            .await
            .expect("fetch should succeed");

        mock.assert_async().await;
        assert_eq!(artifact.body, b"var x = 1;");
        assert_eq!(artifact.content_type.as_deref(), Some("text/javascript"));
        // Weak-validator prefix and quotes are normalized away.
        assert_eq!(artifact.etag.as_deref(), Some("abc123"));
        assert!(artifact.last_modified.is_some());
    }

    #[tokio::test]
    async fn direct_fetch_sends_session_user_agent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/app.js")
            .match_header("user-agent", "session-ua/1.0")
            .with_body("ok")
            .create_async()
            .await;

        let fetcher = DirectFetcher::new("session-ua/1.0", &[], Duration::from_secs(5))
            .expect("client should build");
        fetcher
            .fetch_text(&format!("{}/v1/app.js", server.url()))
            .await
            .expect("fetch should succeed");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn direct_fetch_rejects_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/gone.js")
            .with_status(404)
            .create_async()
            .await;

        let fetcher = DirectFetcher::new("test-agent", &[], Duration::from_secs(5))
            .expect("client should build");
        let result = fetcher
            .fetch_text(&format!("{}/gone.js", server.url()))
            .await;
        assert!(result.is_err());
    }
}
