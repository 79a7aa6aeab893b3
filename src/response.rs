use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_LENGTH;
use hyper::{Method, Request as HttpRequest};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::time;

use crate::error::Error;
use crate::model::{Request, Response};

/// Delivers a response to the request's pre-signed url.
#[async_trait]
pub trait SendResponse: Send + Sync {
    async fn send_response(&self, request: &Request, response: &Response) -> Result<(), Error>;
}

/// How long to wait for the pre-signed url to answer a response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ResponseClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl ResponseClient {
    pub fn new() -> Self {
        ResponseClient {
            client: Client::builder(TokioExecutor::new()).build(HttpsConnector::new()),
            timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn put(&self, put: HttpRequest<Full<Bytes>>) -> Result<(), Error> {
        let resp = self.client.request(put).await?;
        let status = resp.status();
        let body = resp.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            error!("S3 response: {} {}", status, String::from_utf8_lossy(&body));
            return Err(Error::ResponseStatus {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(())
    }
}

impl Default for ResponseClient {
    fn default() -> Self {
        ResponseClient::new()
    }
}

#[async_trait]
impl SendResponse for ResponseClient {
    async fn send_response(&self, request: &Request, response: &Response) -> Result<(), Error> {
        let response_json = serde_json::to_vec(response).map_err(Error::Encode)?;

        // The url is pre-signed without a content type, so none is sent.
        let put = HttpRequest::builder()
            .method(Method::PUT)
            .uri(request.response_url.as_str())
            .header(CONTENT_LENGTH, response_json.len())
            .body(Full::new(Bytes::from(response_json)))?;

        match time::timeout(self.timeout, self.put(put)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ResponseTimeout(self.timeout)),
        }
    }
}
