use anyhow::Result;
use castscan_core::pick_user_agent;
use regex::Regex;
use reqwest::{header, Client, StatusCode};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::trace;
use url::Url;

fn stream_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s"'<>]+"#).expect("static regex"))
}

/// HTTP(S) stream links of a playlist in file order. Directive lines are ignored.
pub fn extract_stream_links(payload: &str) -> Vec<Url> {
    payload
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .flat_map(|l| stream_link().find_iter(l))
        .filter_map(|m| Url::parse(m.as_str()).ok())
        .collect()
}

/// Opens stream links and waits for the first bytes.
#[derive(Clone)]
pub struct LinkChecker {
    client: Client,
    timeout: Duration,
    read_timeout: Duration,
    user_agents: Arc<Vec<String>>,
}

impl LinkChecker {
    pub fn new(timeout: Duration, read_timeout: Duration, user_agents: Vec<String>) -> Result<Self> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        Ok(LinkChecker { client, timeout, read_timeout, user_agents: Arc::new(user_agents) })
    }

    /// Status 200 within `timeout`, then a non-empty chunk within `read_timeout`.
    pub async fn is_alive(&self, url: &Url) -> bool {
        let req = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, pick_user_agent(&self.user_agents));
        let mut resp = match timeout(self.timeout, req.send()).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                trace!(%url, error = %e, "link unreachable");
                return false;
            }
            Err(_) => return false,
        };
        if resp.status() != StatusCode::OK {
            trace!(%url, status = resp.status().as_u16(), "link refused");
            return false;
        }
        let first_bytes = async {
            loop {
                match resp.chunk().await {
                    Ok(Some(chunk)) if !chunk.is_empty() => return true,
                    Ok(Some(_)) => continue,
                    _ => return false,
                }
            }
        };
        timeout(self.read_timeout, first_bytes).await.unwrap_or(false)
    }

    /// Check links concurrently; true as soon as one yields data.
    pub async fn any_alive(&self, links: Vec<Url>) -> bool {
        let mut set = JoinSet::new();
        for url in links {
            let checker = self.clone();
            set.spawn(async move { checker.is_alive(&url).await });
        }
        while let Some(res) = set.join_next().await {
            if matches!(res, Ok(true)) {
                set.abort_all();
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn checker() -> LinkChecker {
        LinkChecker::new(Duration::from_secs(2), Duration::from_secs(1), Vec::new()).unwrap()
    }

    #[test]
    fn extracts_http_links_only() {
        let payload = "#EXTM3U\n#EXTINF:-1 group-title=\"x\",A\nhttp://88.1.2.3:8080/rtp/239.0.0.1:5000\n\
                       #EXTINF:-1,B\nrtp://239.0.0.2:5000\n#EXTINF:-1,C\n  https://cdn.example/live/c.m3u8  \n";
        let links: Vec<String> = extract_stream_links(payload).into_iter().map(String::from).collect();
        assert_eq!(
            links,
            vec!["http://88.1.2.3:8080/rtp/239.0.0.1:5000", "https://cdn.example/live/c.m3u8"]
        );
        assert!(extract_stream_links("#EXTM3U\n#EXTINF:-1,A\n").is_empty());
    }

    #[tokio::test]
    async fn data_means_alive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/live"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x47u8; 188]))
            .mount(&server)
            .await;
        let url = Url::parse(&format!("{}/live", server.uri())).unwrap();
        assert!(checker().is_alive(&url).await);
    }

    #[tokio::test]
    async fn empty_body_or_error_status_is_dead() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let c = checker();
        assert!(!c.is_alive(&Url::parse(&format!("{}/empty", server.uri())).unwrap()).await);
        assert!(!c.is_alive(&Url::parse(&format!("{}/missing", server.uri())).unwrap()).await);
    }

    #[tokio::test]
    async fn stalled_stream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ts").set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;
        let url = Url::parse(&format!("{}/slow", server.uri())).unwrap();
        assert!(!checker().is_alive(&url).await);
    }
}
