use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use isahc::{
    config::Configurable,
    http::{ header::CONTENT_TYPE, Request },
    AsyncBody,
    AsyncReadResponseExt,
    HttpClient,
    HttpClientBuilder,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{ resolve_base_url, Config };
use crate::endpoint::{ Endpoint, IdRange };
use crate::metrics::{ Metrics, NO_STATUS };
use crate::runner::RunError;

/// Terminal result of one dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A response arrived and its body was fully read.
    Response { latency: Duration, status: u16 },
    /// The request could not be built or the transport failed.
    Failed,
    /// The run was cancelled while the request was in flight. Not recorded.
    Aborted,
}

/// Issues one request per call. Shared by every worker of a run.
#[async_trait]
pub trait RequestExecutor: Send + Sync + 'static {
    async fn execute(&self, endpoint: &Endpoint, cancel: &CancellationToken) -> Outcome;
}

/// Executor sending real HTTP requests through one pooled client.
pub struct HttpExecutor {
    client: HttpClient, // shared connection pool
    base_url: String,   // no trailing slash
    ids: IdRange,
    metrics: Arc<Metrics>,
}

impl HttpExecutor {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Result<Self, RunError> {
        let base_url = resolve_base_url(&config.server_addr)?;

        let client = HttpClientBuilder::new()
            .timeout(config.timeout)
            .connect_timeout(config.connection_timeout)
            // idle pool only, in-flight connections are not capped
            .connection_cache_size(config.concurrency * 2)
            .build()?;

        Ok(Self {
            client,
            base_url: trim_base(&base_url),
            ids: IdRange::new(config.dataset_size),
            metrics,
        })
    }

    fn build_request(
        &self,
        endpoint: &Endpoint
    ) -> Result<Request<AsyncBody>, isahc::http::Error> {
        let uri = format!("{}{}", self.base_url, endpoint.resolve_path(&self.ids));
        let builder = Request::builder().method(endpoint.method.as_str()).uri(uri);

        match endpoint.body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(AsyncBody::from(body)),
            None => builder.body(AsyncBody::empty()),
        }
    }

    /// Send and drain the body so the connection goes back to the pool.
    async fn exchange(&self, request: Request<AsyncBody>) -> Result<u16, isahc::Error> {
        let mut response = self.client.send_async(request).await?;
        response.consume().await?;
        Ok(response.status().as_u16())
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(&self, endpoint: &Endpoint, cancel: &CancellationToken) -> Outcome {
        let request = match self.build_request(endpoint) {
            Ok(request) => request,
            Err(err) => {
                tracing::trace!(%endpoint, error = %err, "failed to build request");
                self.metrics.record_error(NO_STATUS);
                return Outcome::Failed;
            }
        };

        let start = Instant::now();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Aborted,
            result = self.exchange(request) => match result {
                Ok(status) => {
                    let latency = start.elapsed();
                    self.metrics.record_request(latency, status);
                    Outcome::Response { latency, status }
                }
                Err(err) => {
                    tracing::trace!(%endpoint, error = %err, "request failed");
                    self.metrics.record_error(NO_STATUS);
                    Outcome::Failed
                }
            },
        }
    }
}

fn trim_base(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopSampler;
    use tokio::task::JoinSet;
    use wiremock::matchers::{ body_string, header, method, path };
    use wiremock::{ Mock, MockServer, ResponseTemplate };

    fn executor_for(server_addr: String) -> (HttpExecutor, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::with_sampler(NoopSampler));
        let config = Config {
            server_addr,
            timeout: Duration::from_secs(5),
            concurrency: 2,
            ..Config::default()
        };
        let executor = HttpExecutor::new(&config, Arc::clone(&metrics)).unwrap();
        (executor, metrics)
    }

    #[tokio::test]
    async fn records_successful_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .expect(1)
            .mount(&server)
            .await;

        let (executor, metrics) = executor_for(server.uri());
        let endpoint = Endpoint::parse("GET:/users/1").unwrap();
        let outcome = executor.execute(&endpoint, &CancellationToken::new()).await;

        assert!(matches!(outcome, Outcome::Response { status: 200, .. }));
        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.success_requests, 1);
        assert!(snap.latency.is_some());
    }

    #[tokio::test]
    async fn sends_json_body_for_mutating_methods() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/items"))
            .and(header("content-type", "application/json"))
            .and(body_string(crate::endpoint::DEFAULT_BODY))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let (executor, metrics) = executor_for(server.uri());
        let endpoint = Endpoint::parse("POST:/items").unwrap();
        let outcome = executor.execute(&endpoint, &CancellationToken::new()).await;

        assert!(matches!(outcome, Outcome::Response { status: 201, .. }));
        assert_eq!(metrics.snapshot().success_requests, 1);
    }

    #[tokio::test]
    async fn error_statuses_are_recorded_with_latency() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (executor, metrics) = executor_for(server.uri());
        let endpoint = Endpoint::parse("DELETE:/items/1").unwrap();
        executor.execute(&endpoint, &CancellationToken::new()).await;

        let snap = metrics.snapshot();
        assert_eq!(snap.error_requests, 1);
        assert_eq!(snap.errors_by_status.get(&503), Some(&1));
        assert!(snap.latency.is_some());
    }

    #[tokio::test]
    async fn transport_failure_records_sentinel_status() {
        // bind then release a port so nothing is listening on it
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let (executor, metrics) = executor_for(format!("127.0.0.1:{port}"));
        let endpoint = Endpoint::parse("GET:/").unwrap();
        let outcome = executor.execute(&endpoint, &CancellationToken::new()).await;

        assert_eq!(outcome, Outcome::Failed);
        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.errors_by_status.get(&NO_STATUS), Some(&1));
        assert!(snap.latency.is_none());
    }

    #[tokio::test]
    async fn cancelled_requests_are_not_recorded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let (executor, metrics) = executor_for(server.uri());
        let endpoint = Endpoint::parse("GET:/slow").unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = executor.execute(&endpoint, &cancel).await;

        assert_eq!(outcome, Outcome::Aborted);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(metrics.snapshot().total_requests, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_requests_beyond_concurrency_do_not_queue() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        // burst workers outnumber the configured concurrency of 2
        let (executor, metrics) = executor_for(server.uri());
        let executor = Arc::new(executor);
        let mut tasks = JoinSet::new();
        let started = std::time::Instant::now();
        for _ in 0..10 {
            let executor = Arc::clone(&executor);
            tasks.spawn(async move {
                let endpoint = Endpoint::parse("GET:/slow").unwrap();
                executor.execute(&endpoint, &CancellationToken::new()).await
            });
        }

        let mut latencies = Vec::new();
        while let Some(outcome) = tasks.join_next().await {
            match outcome.unwrap() {
                Outcome::Response { latency, status: 200 } => latencies.push(latency),
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(latencies.len(), 10);
        assert!(started.elapsed() < Duration::from_millis(900), "{:?}", started.elapsed());
        for latency in &latencies {
            assert!(*latency < Duration::from_millis(600), "{latency:?}");
        }
        assert_eq!(metrics.snapshot().success_requests, 10);
    }

    #[tokio::test]
    async fn resolves_dynamic_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (executor, _) = executor_for(server.uri());
        let endpoint = Endpoint::parse("GET:/items/{id}").unwrap();
        executor.execute(&endpoint, &CancellationToken::new()).await;

        let received = server.received_requests().await.unwrap();
        let path = received[0].url.path().to_string();
        assert!(path.starts_with("/items/"));
        assert!(path.trim_start_matches("/items/").parse::<usize>().is_ok(), "{path}");
    }

    #[test]
    fn strips_trailing_slash_from_base() {
        let url = resolve_base_url(":8080").unwrap();
        assert_eq!(trim_base(&url), "http://localhost:8080");
    }
}
