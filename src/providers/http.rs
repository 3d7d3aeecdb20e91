use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::AUTHORIZATION;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::connection::SasSigner;
use crate::domains::gateway::{
    AcceptRequest, AcceptedSession, CompleteRequest, ErrorResponse, FetchRequest, FetchResponse,
    HealthResponse,
};
use crate::domains::message::{Envelope, ReceivedMessage};
use crate::domains::queue::QueueDescription;
use crate::error::{ProbeError, Result};
use crate::interfaces::broker::{Broker, MessageSender, SessionReceiver, SessionReceiverOptions};
use crate::interfaces::transport::SessionLink;
use crate::providers::prefetch::PrefetchingReceiver;

const TOKEN_TTL_SECS: i64 = 60 * 60;
const WAIT_SLACK: Duration = Duration::from_secs(10);

/// Broker reached through the gateway protocol served by `session-lock-brokerd`.
#[derive(Clone)]
pub struct HttpBroker {
    client: Arc<GatewayClient>,
}

struct GatewayClient {
    base_url: String,
    signer: SasSigner,
    http: reqwest::Client,
}

impl HttpBroker {
    pub fn new(base_url: impl Into<String>, signer: SasSigner) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProbeError::Runtime(e.to_string()))?;
        Ok(Self {
            client: Arc::new(GatewayClient {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                signer,
                http,
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.client.base_url
    }

    pub async fn health(&self) -> Result<()> {
        let response = self.client.dispatch(self.client.request(Method::GET, "health")).await?;
        let health: HealthResponse = decode(response).await?;
        if health.status != "ok" {
            return Err(ProbeError::Broker(format!(
                "gateway reports status '{}'",
                health.status
            )));
        }
        Ok(())
    }
}

impl GatewayClient {
    fn authorization(&self) -> String {
        let expiry = OffsetDateTime::now_utc().unix_timestamp() + TOKEN_TTL_SECS;
        self.signer.token(&self.base_url, expiry)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, join_url(&self.base_url, path))
            .header(AUTHORIZATION, self.authorization())
    }

    fn request_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> RequestBuilder {
        self.request(method, path).json(body)
    }

    async fn dispatch(&self, request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e: reqwest::Error| ProbeError::Http(e.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(error_from_response(response).await)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| ProbeError::Serialization(e.to_string()))
}

async fn error_from_response(response: Response) -> ProbeError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if let Ok(body) = serde_json::from_str::<ErrorResponse>(&text) {
        return ProbeError::from_code(&body.code, body.error);
    }
    match status {
        StatusCode::NOT_FOUND => ProbeError::EntityNotFound(text),
        StatusCode::GONE => ProbeError::SessionLockLost(text),
        _ => ProbeError::Http(format!("{status}: {text}")),
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn queue_path(queue: &str, rest: &str) -> String {
    let queue = urlencoding::encode(queue);
    if rest.is_empty() {
        format!("queues/{queue}")
    } else {
        format!("queues/{queue}/{rest}")
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl Broker for HttpBroker {
    async fn get_queue(&self, name: &str) -> Result<QueueDescription> {
        let request = self.client.request(Method::GET, &queue_path(name, ""));
        decode(self.client.dispatch(request).await?).await
    }

    async fn create_queue(&self, description: &QueueDescription) -> Result<QueueDescription> {
        let request =
            self.client
                .request_json(Method::PUT, &queue_path(&description.name, ""), description);
        decode(self.client.dispatch(request).await?).await
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let request = self.client.request(Method::DELETE, &queue_path(name, ""));
        self.client.dispatch(request).await?;
        Ok(())
    }

    async fn create_sender(&self, queue: &str) -> Result<Box<dyn MessageSender>> {
        Ok(Box::new(HttpSender {
            client: self.client.clone(),
            queue: queue.to_string(),
        }))
    }

    async fn accept_next_session(
        &self,
        queue: &str,
        options: SessionReceiverOptions,
    ) -> Result<Box<dyn SessionReceiver>> {
        let body = AcceptRequest {
            max_wait_ms: millis(options.max_wait),
        };
        let request = self
            .client
            .request_json(Method::POST, &queue_path(queue, "sessions/accept"), &body)
            .timeout(options.max_wait + WAIT_SLACK);
        let accepted: AcceptedSession = decode(self.client.dispatch(request).await?).await?;
        let link = HttpLink {
            client: self.client.clone(),
            receiver_id: accepted.receiver_id,
        };
        Ok(Box::new(PrefetchingReceiver::new(
            link,
            accepted.session_id,
            accepted.locked_until,
            options.prefetch_count,
        )))
    }
}

pub struct HttpSender {
    client: Arc<GatewayClient>,
    queue: String,
}

#[async_trait]
impl MessageSender for HttpSender {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn send_batch(&self, batch: &[Envelope]) -> Result<()> {
        let body = json!({ "messages": batch });
        let request =
            self.client
                .request_json(Method::POST, &queue_path(&self.queue, "messages"), &body);
        self.client.dispatch(request).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct HttpLink {
    client: Arc<GatewayClient>,
    receiver_id: Uuid,
}

impl HttpLink {
    fn path(&self, rest: &str) -> String {
        if rest.is_empty() {
            format!("receivers/{}", self.receiver_id)
        } else {
            format!("receivers/{}/{rest}", self.receiver_id)
        }
    }
}

#[async_trait]
impl SessionLink for HttpLink {
    async fn fetch(&self, max_messages: u32, max_wait: Duration) -> Result<Vec<ReceivedMessage>> {
        let body = FetchRequest {
            max_messages,
            max_wait_ms: millis(max_wait),
        };
        let request = self
            .client
            .request_json(Method::POST, &self.path("messages"), &body)
            .timeout(max_wait + WAIT_SLACK);
        let response: FetchResponse = decode(self.client.dispatch(request).await?).await?;
        Ok(response.messages)
    }

    async fn settle(&self, lock_token: Uuid) -> Result<()> {
        let body = CompleteRequest { lock_token };
        let request = self
            .client
            .request_json(Method::POST, &self.path("complete"), &body);
        self.client.dispatch(request).await?;
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let request = self.client.request(Method::DELETE, &self.path(""));
        match self.client.dispatch(request).await {
            Ok(_) | Err(ProbeError::EntityNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_gateway_paths() {
        assert_eq!(join_url("http://h:1/", "/health"), "http://h:1/health");
        assert_eq!(queue_path("a b", ""), "queues/a%20b");
        assert_eq!(queue_path("q", "sessions/accept"), "queues/q/sessions/accept");
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }
}
