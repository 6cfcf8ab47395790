use anyhow::Result;
use castscan_core::{pick_user_agent, Candidate};
use reqwest::{header, Client, Response};
use std::net::SocketAddrV4;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::trace;
use url::Url;

pub const DEFAULT_PROBE_URL: &str = "https://iptv.cqshushu.com/index.php";

/// Builds the validation URL for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestShape {
    pub base_url: Url,
    /// Endpoint category, e.g. `multicast` or `hotel`.
    pub tag: String,
    /// Ask the service to include the channel list.
    pub channels: bool,
    /// Output format directive.
    pub format: String,
}

impl RequestShape {
    pub fn new(base_url: Url, tag: impl Into<String>) -> Self {
        RequestShape { base_url, tag: tag.into(), channels: true, format: "m3u".into() }
    }

    pub fn url_for(&self, addr: SocketAddrV4) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("s", &addr.to_string());
            q.append_pair("t", &self.tag);
            if self.channels {
                q.append_pair("channels", "1");
            }
            q.append_pair("download", &self.format);
        }
        url
    }
}

/// Structural check separating a real playlist from an error page or an empty shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub leading: String,
    pub entry: String,
    /// A body needs strictly more entries than this.
    pub min_entries: usize,
}

impl Default for Signature {
    fn default() -> Self {
        Signature { leading: "#EXTM3U".into(), entry: "#EXTINF".into(), min_entries: 5 }
    }
}

impl Signature {
    /// Entry marker count, or `None` when the body does not start with the leading token.
    pub fn entries(&self, body: &str) -> Option<usize> {
        let head = body.trim_start_matches('\u{feff}').trim_start();
        if !head.starts_with(&self.leading) {
            return None;
        }
        Some(head.matches(self.entry.as_str()).count())
    }

    pub fn accepts(&self, body: &str) -> bool {
        self.entries(body).is_some_and(|n| n > self.min_entries)
    }
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub timeout: Duration,
    pub user_agents: Vec<String>,
    pub referer: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        ProbeOptions {
            timeout: Duration::from_secs(12),
            user_agents: Vec::new(),
            referer: None,
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub candidate: Candidate,
    pub success: bool,
    pub status: Option<u16>,
    /// Raw response body, kept only for hits.
    pub payload: Option<Vec<u8>>,
    pub signature_count: usize,
    pub observed_at: OffsetDateTime,
    pub error: Option<String>,
}

impl ProbeOutcome {
    fn miss(candidate: Candidate, status: Option<u16>, signature_count: usize, error: Option<String>) -> Self {
        ProbeOutcome {
            candidate,
            success: false,
            status,
            payload: None,
            signature_count,
            observed_at: OffsetDateTime::now_utc(),
            error,
        }
    }
}

/// Issues one validation request per candidate. Holds no pacing or retry state.
pub struct EndpointProbe {
    client: Client,
    shape: RequestShape,
    signature: Signature,
    opts: ProbeOptions,
}

impl EndpointProbe {
    pub fn new(shape: RequestShape, signature: Signature, opts: ProbeOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(opts.timeout)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()?;
        Ok(EndpointProbe { client, shape, signature, opts })
    }

    pub fn shape(&self) -> &RequestShape {
        &self.shape
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub async fn probe(&self, candidate: &Candidate) -> ProbeOutcome {
        let url = self.shape.url_for(candidate.addr);
        let mut req = self
            .client
            .get(url)
            .header(header::USER_AGENT, pick_user_agent(&self.opts.user_agents));
        if let Some(r) = &self.opts.referer {
            req = req.header(header::REFERER, r);
        }
        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => return ProbeOutcome::miss(*candidate, None, 0, Some(e.to_string())),
        };
        let status = resp.status().as_u16();
        if status != 200 {
            return ProbeOutcome::miss(*candidate, Some(status), 0, None);
        }
        let body = match read_capped(resp, self.opts.max_body_bytes).await {
            Ok(b) => b,
            Err(e) => return ProbeOutcome::miss(*candidate, Some(status), 0, Some(e.to_string())),
        };
        let text = String::from_utf8_lossy(&body);
        let count = self.signature.entries(&text).unwrap_or(0);
        if !self.signature.accepts(&text) {
            trace!(endpoint = %candidate, entries = count, "signature rejected");
            return ProbeOutcome::miss(*candidate, Some(status), count, None);
        }
        ProbeOutcome {
            candidate: *candidate,
            success: true,
            status: Some(status),
            payload: Some(body),
            signature_count: count,
            observed_at: OffsetDateTime::now_utc(),
            error: None,
        }
    }
}

async fn read_capped(mut resp: Response, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        let room = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if buf.len() >= limit {
            break;
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use castscan_core::Origin;
    use std::net::Ipv4Addr;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn playlist(entries: usize) -> String {
        let mut s = String::from("#EXTM3U\n");
        for i in 0..entries {
            s.push_str(&format!(
                "#EXTINF:-1 group-title=\"湖北电信组播\",CCTV{i}\nhttp://88.1.2.3:8080/rtp/239.0.0.{i}:5000\n"
            ));
        }
        s
    }

    fn candidate(port: u16) -> Candidate {
        Candidate::new(Ipv4Addr::new(88, 1, 2, 3), port, Origin::StaticList)
    }

    async fn probe_for(server: &MockServer) -> EndpointProbe {
        let base = Url::parse(&format!("{}/index.php", server.uri())).unwrap();
        let opts = ProbeOptions { timeout: Duration::from_secs(2), ..ProbeOptions::default() };
        EndpointProbe::new(RequestShape::new(base, "multicast"), Signature::default(), opts).unwrap()
    }

    #[test]
    fn request_carries_endpoint_and_directives() {
        let shape = RequestShape::new(Url::parse("https://example.test/index.php").unwrap(), "multicast");
        let url = shape.url_for(SocketAddrV4::new(Ipv4Addr::new(88, 1, 2, 3), 8080));
        assert_eq!(
            url.as_str(),
            "https://example.test/index.php?s=88.1.2.3%3A8080&t=multicast&channels=1&download=m3u"
        );
    }

    #[test]
    fn signature_rejects_empty_shell() {
        let sig = Signature::default();
        assert!(sig.accepts(&playlist(6)));
        assert!(!sig.accepts(&playlist(5)));
        assert_eq!(sig.entries(&playlist(2)), Some(2));
        assert_eq!(sig.entries("<html>#EXTINF</html>"), None);
        assert!(sig.accepts(&format!("\u{feff}\n{}", playlist(7))));
    }

    #[tokio::test]
    async fn hit_keeps_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.php"))
            .and(query_param("s", "88.1.2.3:8080"))
            .and(query_param("t", "multicast"))
            .and(query_param("download", "m3u"))
            .respond_with(ResponseTemplate::new(200).set_body_string(playlist(6)))
            .mount(&server)
            .await;

        let out = probe_for(&server).await.probe(&candidate(8080)).await;
        assert!(out.success);
        assert_eq!(out.status, Some(200));
        assert_eq!(out.signature_count, 6);
        assert_eq!(out.payload.as_deref(), Some(playlist(6).as_bytes()));
    }

    #[tokio::test]
    async fn hit_payload_is_not_transcoded() {
        // GBK for 湖北 in a channel name, plus a byte invalid in any encoding
        let body = [playlist(6).as_bytes(), &[0xba, 0xfe, 0xb1, 0xb1, 0xff, b'\n']].concat();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let out = probe_for(&server).await.probe(&candidate(8080)).await;
        assert!(out.success);
        assert_eq!(out.payload, Some(body));
    }

    #[tokio::test]
    async fn few_entries_is_a_miss() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(playlist(3)))
            .mount(&server)
            .await;

        let out = probe_for(&server).await.probe(&candidate(8080)).await;
        assert!(!out.success);
        assert_eq!(out.signature_count, 3);
        assert!(out.payload.is_none());
    }

    #[tokio::test]
    async fn non_200_is_a_miss() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string(playlist(10)))
            .mount(&server)
            .await;

        let out = probe_for(&server).await.probe(&candidate(8080)).await;
        assert!(!out.success);
        assert_eq!(out.status, Some(502));
    }

    #[tokio::test]
    async fn unreachable_service_is_a_miss_with_error() {
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let base = Url::parse(&format!("http://127.0.0.1:{port}/index.php")).unwrap();
        let opts = ProbeOptions { timeout: Duration::from_secs(2), ..ProbeOptions::default() };
        let probe = EndpointProbe::new(RequestShape::new(base, "multicast"), Signature::default(), opts).unwrap();

        let out = probe.probe(&candidate(8080)).await;
        assert!(!out.success);
        assert!(out.status.is_none());
        assert!(out.error.is_some());
    }
}
