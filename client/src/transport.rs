use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A single HTTP attempt.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(&'static str, String)>,
    /// Time allowed for this attempt alone.
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Failure to get any HTTP response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Connection(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Connection(err.to_string())
        }
    }
}

/// Trait for issuing single HTTP attempts. Retrying is the caller's concern.
pub trait Transport: Clone + Send + Sync + 'static {
    fn execute(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send;
}

/// [Transport] backed by `reqwest`.
#[derive(Clone, Default)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http })
    }
}

impl Transport for HttpTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.http.get(request.url),
            Method::Post => self.http.post(request.url),
        }
        .timeout(request.timeout);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}

#[cfg(any(test, feature = "mocks"))]
pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// A scripted reply for [Mock].
    #[derive(Clone, Debug)]
    pub enum Reply {
        Status(u16, String),
        Fail(TransportError),
        /// Never responds; the attempt can only end by timing out.
        Hang,
    }

    impl Reply {
        pub fn status(status: u16) -> Self {
            Reply::Status(status, String::new())
        }
    }

    /// A mock transport that records requests and replays scripted replies.
    ///
    /// When the script runs out, every further attempt gets `200` with an empty JSON body.
    #[derive(Clone, Default)]
    pub struct Mock {
        pub requests: Arc<Mutex<Vec<HttpRequest>>>,
        script: Arc<Mutex<VecDeque<Reply>>>,
        latency: Duration,
    }

    impl Mock {
        pub fn new(script: impl IntoIterator<Item = Reply>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into_iter().collect())),
                ..Default::default()
            }
        }

        /// Delays every reply by `latency` (on the tokio clock).
        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub fn push(&self, reply: Reply) {
            self.script
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(reply);
        }

        pub fn attempts(&self) -> usize {
            self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
        }

        pub fn recorded(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    impl Transport for Mock {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(request);
            let reply = self
                .script
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .unwrap_or_else(|| Reply::Status(200, "{}".to_string()));

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            match reply {
                Reply::Status(status, body) => Ok(HttpResponse { status, body }),
                Reply::Fail(err) => Err(err),
                Reply::Hang => std::future::pending().await,
            }
        }
    }
}
