use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as ReqwestClient, Method as ReqwestMethod};
use relayflow_utils::FlowResult;
use url::Url;

use super::traits::{Method, Request, Response};

/// Executes wire-level requests for the pagination loop.
///
/// Non-2xx statuses are returned as ordinary responses; only transport
/// failures surface as errors.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: &Request) -> FlowResult<Response>;
}

#[derive(Debug)]
pub struct HttpClientBuilder {
    timeout: Duration,
    user_agent: String,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("relayflow/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpClientBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn user_agent<T: Into<String>>(mut self, user_agent: T) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> FlowResult<HttpFetcher> {
        let client = ReqwestClient::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent)
            .build()?;
        Ok(HttpFetcher(client))
    }
}

/// `HttpClient` backed by reqwest.
#[derive(Clone, Debug)]
pub struct HttpFetcher(ReqwestClient);

impl HttpFetcher {
    pub fn new(client: ReqwestClient) -> Self {
        Self(client)
    }

    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }
}

#[async_trait]
impl HttpClient for HttpFetcher {
    async fn execute(&self, request: &Request) -> FlowResult<Response> {
        let url = Url::parse(&request.url)?;
        let method = match request.method {
            Method::Get => ReqwestMethod::GET,
            Method::Post => ReqwestMethod::POST,
        };

        let mut builder = self.0.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let resp = builder.send().await?;
        let mut response = Response::new(request.url.clone(), resp.status().as_u16(), "");
        for (name, value) in resp.headers() {
            // Non-UTF8 header values are not meaningful to pagination or rate limits.
            if let Ok(value) = value.to_str() {
                response.append_header(name.as_str(), value);
            }
        }
        response.body = resp.text().await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_unparseable_urls_before_sending() {
        let client = HttpFetcher::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let err = client.execute(&Request::get("not a url")).await.unwrap_err();
        assert!(matches!(err, relayflow_utils::error::Error::UrlParseError(_)));
    }
}
