use crate::metrics::{encode_batch, MetricPoint};
use reqwest::{Client, StatusCode};
use std::future::Future;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sink rejected write ({status}): {body}")]
    Rejected { status: StatusCode, body: String },
}

pub trait MetricSink {
    fn write_points(
        &self,
        points: &[MetricPoint],
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

#[derive(Debug, Clone)]
pub struct InfluxSink {
    client: Client,
    write_url: Url,
    database: String,
}

impl InfluxSink {
    pub fn new(client: Client, host: &str, port: u16, database: &str) -> Result<Self, url::ParseError> {
        let mut write_url = Url::parse(&format!("http://{host}:{port}/write"))?;
        write_url
            .query_pairs_mut()
            .append_pair("db", database)
            .append_pair("precision", "ms");
        Ok(Self {
            client,
            write_url,
            database: database.to_string(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }
}

impl MetricSink for InfluxSink {
    async fn write_points(&self, points: &[MetricPoint]) -> Result<(), SinkError> {
        let body = encode_batch(points);
        if body.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(self.write_url.clone())
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected { status, body });
        }
        tracing::trace!(database = %self.database, points = points.len(), "wrote batch");
        Ok(())
    }
}
