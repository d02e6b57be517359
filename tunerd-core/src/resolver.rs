use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::Client;
use tracing::debug;
use url::Url;

/// Resolves a catalog URL to the concrete media source, following at most
/// one redirect hop. Any failure falls back to the original URL; the
/// capture program gets to make its own attempt either way.
#[async_trait]
pub trait StreamUrlResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> String;
}

pub struct HttpUrlResolver {
    client: Client,
}

impl HttpUrlResolver {
    pub fn new() -> reqwest::Result<Self> {
        let client = Client::builder()
            .user_agent("tunerd/0.1")
            .redirect(Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StreamUrlResolver for HttpUrlResolver {
    async fn resolve(&self, url: &str) -> String {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(error) => {
                debug!(url, %error, "redirect probe failed, keeping original url");
                return url.to_string();
            }
        };
        if !response.status().is_redirection() {
            return url.to_string();
        }
        let Some(location) = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
        else {
            return url.to_string();
        };
        let resolved = Url::parse(url)
            .ok()
            .and_then(|base| base.join(location).ok())
            .map(|joined| joined.to_string());
        match resolved {
            Some(target) => {
                debug!(url, target = %target, "followed one redirect hop");
                target
            }
            None => url.to_string(),
        }
    }
}

/// Resolver that never touches the network; catalog URLs are taken as-is.
/// Used by tests and by deployments whose playlists carry direct URLs.
pub struct PassthroughResolver;

#[async_trait]
impl StreamUrlResolver for PassthroughResolver {
    async fn resolve(&self, url: &str) -> String {
        url.to_string()
    }
}
