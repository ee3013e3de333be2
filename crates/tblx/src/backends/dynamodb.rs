//! 🗄️ DynamoDB table backend: parallel `Scan`, one segment per caller.
//!
//! COLD OPEN. EXT. US-EAST-1, 3:47 AM.
//!
//! The table had 400 million items and a provisioned read capacity of "please
//! be gentle". We asked for segment 7 of 32. DynamoDB answered with a page, a
//! `LastEvaluatedKey`, and the quiet understanding that if we asked too fast,
//! it would start saying `ProvisionedThroughputExceededException` and mean it.
//!
//! 🧠 Knowledge graph:
//! - `DynamoDbTableConfig`: region, optional endpoint (DynamoDB Local, wiremock),
//!   SDK-level retry attempts
//! - `DynamoDbTable`: wraps `aws_sdk_dynamodb::Client`, implements `TableReader`
//! - Throttle codes classify as `TableError::Throttled`. The SDK's own retries are
//!   dialed down to one attempt by default, so throttles reach the scanner's
//!   backoff instead of being silently absorbed.
//! - Transient failures (5xx, timeouts, dropped connections) are retried right
//!   here, `transient_retries` times, so one flaky response three hours into an
//!   export doesn't sink the whole segment.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::retry::RetryConfig;
use aws_sdk_dynamodb::config::http::HttpResponse;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::scan::{ScanError, ScanOutput};
use aws_sdk_dynamodb::types::AttributeValue;
use serde::Deserialize;
use tracing::{trace, warn};

use crate::backends::{ContinuationToken, ScanPage, ScanRequest, TableReader};
use crate::backoff::Backoff;
use crate::common::{Record, Value};
use crate::errors::TableError;

// -- 🐢 every way DynamoDB has of saying "slow down"
const THROTTLE_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "ThrottlingException",
];

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DynamoDbTableConfig {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// SDK-level attempts per request. Above 1 the SDK also retries throttles
    /// on its own, out of sight of the scanner's backoff and its events.
    #[serde(default = "default_sdk_max_attempts")]
    pub sdk_max_attempts: u32,
    /// Retries for 5xx responses, timeouts and connection failures. Throttles
    /// never count against these.
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    #[serde(default = "default_transient_backoff_ms")]
    pub transient_backoff_ms: u64,
}

fn default_region() -> String {
    // -- 🏖️ If you don't choose a region, the region chooses you. And it chose Virginia.
    "us-east-1".to_string()
}

fn default_sdk_max_attempts() -> u32 {
    1
}

fn default_transient_retries() -> u32 {
    20
}

fn default_transient_backoff_ms() -> u64 {
    100
}

// -- ⏱️ transient waits double too, but a blip is not worth more than this per try
const MAX_TRANSIENT_WAIT: Duration = Duration::from_secs(20);

/// 🗄️ A DynamoDB table, scanned segment by segment.
#[derive(Debug, Clone)]
pub struct DynamoDbTable {
    client: aws_sdk_dynamodb::Client,
    transient_retries: u32,
    transient_base: Duration,
}

impl DynamoDbTable {
    /// 🔧 Build the client from the environment: credentials, region, the works.
    /// Env vars → ~/.aws/config → IAM role → hope.
    pub async fn new(config: &DynamoDbTableConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .retry_config(RetryConfig::standard().with_max_attempts(config.sdk_max_attempts.max(1)));
        if let Some(endpoint_url) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        let sdk_config = loader.load().await;
        Self::from_client(aws_sdk_dynamodb::Client::new(&sdk_config)).with_transient_retries(
            config.transient_retries,
            Duration::from_millis(config.transient_backoff_ms),
        )
    }

    pub fn from_client(client: aws_sdk_dynamodb::Client) -> Self {
        Self {
            client,
            transient_retries: default_transient_retries(),
            transient_base: Duration::from_millis(default_transient_backoff_ms()),
        }
    }

    pub fn with_transient_retries(mut self, retries: u32, base: Duration) -> Self {
        self.transient_retries = retries;
        self.transient_base = base;
        self
    }
}

#[async_trait]
impl TableReader for DynamoDbTable {
    async fn scan(&self, request: &ScanRequest) -> Result<ScanPage, TableError> {
        let start_key = match &request.token {
            None => None,
            Some(ContinuationToken::DynamoKey(key)) => Some(key.clone()),
            Some(other) => {
                return Err(TableError::other(anyhow!(
                    "💀 DynamoDB was handed a token it never minted: {other:?}"
                )));
            }
        };

        let mut backoff = Backoff::new(self.transient_base);
        loop {
            let result = self
                .client
                .scan()
                .table_name(&request.table)
                .segment(to_i32(request.segment)?)
                .total_segments(to_i32(request.total_segments)?)
                .set_exclusive_start_key(start_key.clone())
                .send()
                .await;

            match result {
                Ok(output) => return Ok(page_from(request, &output)),
                Err(err) if err.code().is_some_and(|code| THROTTLE_CODES.contains(&code)) => {
                    return Err(TableError::throttled(DisplayErrorContext(&err).to_string()));
                }
                Err(err) if is_transient(&err) && backoff.attempts() < self.transient_retries => {
                    let wait = backoff.next_wait().min(MAX_TRANSIENT_WAIT);
                    warn!(
                        "🔁 scan of '{}' segment {} hiccuped (retry {} of {}), waiting {:?}: {}",
                        request.table,
                        request.segment,
                        backoff.attempts(),
                        self.transient_retries,
                        wait,
                        DisplayErrorContext(&err)
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => {
                    return Err(TableError::other(anyhow::Error::new(err).context(format!(
                        "💀 Scan of table '{}' segment {}/{} failed",
                        request.table, request.segment, request.total_segments
                    ))));
                }
            }
        }
    }
}

fn page_from(request: &ScanRequest, output: &ScanOutput) -> ScanPage {
    let records: Vec<Record> = output.items().iter().map(record_from_item).collect();
    trace!(
        "📄 segment {} got {} items from {}",
        request.segment,
        records.len(),
        request.table
    );
    let next_token = output
        .last_evaluated_key()
        .filter(|key| !key.is_empty())
        .map(|key| ContinuationToken::DynamoKey(key.clone()));
    ScanPage {
        records,
        next_token,
    }
}

/// 🌩️ Worth another try: the request never got a real answer, or DynamoDB
/// answered with a 5xx.
fn is_transient(err: &SdkError<ScanError, HttpResponse>) -> bool {
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(_) => err
            .raw_response()
            .is_some_and(|raw| raw.status().as_u16() >= 500),
        _ => false,
    }
}

fn to_i32(n: u32) -> Result<i32, TableError> {
    i32::try_from(n).map_err(|_| TableError::other(anyhow!("💀 segment number {n} does not fit DynamoDB's i32")))
}

/// 🔄 Item → Record. Attribute names sorted, since the SDK hands us a `HashMap`
/// and "natural order" should at least be the same order twice.
fn record_from_item(item: &HashMap<String, AttributeValue>) -> Record {
    let mut names: Vec<&String> = item.keys().collect();
    names.sort();
    names
        .into_iter()
        .map(|name| (name.clone(), value_from_attribute(&item[name])))
        .collect()
}

fn value_from_attribute(attribute: &AttributeValue) -> Value {
    match attribute {
        AttributeValue::S(s) => Value::Str(s.clone()),
        AttributeValue::N(n) => Value::Number(n.clone()),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::B(_) => Value::Unsupported("binary"),
        AttributeValue::L(_) => Value::Unsupported("list"),
        AttributeValue::M(_) => Value::Unsupported("map"),
        AttributeValue::Ss(_) => Value::Unsupported("string set"),
        AttributeValue::Ns(_) => Value::Unsupported("number set"),
        AttributeValue::Bs(_) => Value::Unsupported("binary set"),
        _ => Value::Unsupported("unknown"),
    }
}
