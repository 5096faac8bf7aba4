//! Dispatcher: classification, tool chains, retry policy, deadlines.

pub mod intent;

use crate::config::RetryConfig;
use crate::error::{AgentError, ErrorKind};
use crate::ledger::{ExecutionLedger, InvocationRecord};
use crate::tools::registry::{
    Capability, ToolHandler, ToolInput, ToolOutput, ToolRegistry, validate_input,
};
use chrono::Utc;
use intent::{IntentClassifier, KeywordClassifier};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One inbound request.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub text: String,
    /// Explicit tool selection; bypasses classification entirely.
    pub tool_override: Option<String>,
    /// Explicit arguments for the overridden tool.
    pub args: Option<Value>,
}

impl DispatchRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_override: None,
            args: None,
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>, args: Option<Value>) -> Self {
        self.tool_override = Some(name.into());
        self.args = args;
        self
    }
}

/// Final payload in one of the shapes the presentation layer can render.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultPayload {
    Rows(crate::database::result::QueryResult),
    Scalar(Value),
    Text(String),
    Error { kind: ErrorKind, message: String },
}

impl From<ToolOutput> for ResultPayload {
    fn from(output: ToolOutput) -> Self {
        match output {
            ToolOutput::Rows(rows) => Self::Rows(rows),
            ToolOutput::Scalar(value) => Self::Scalar(value),
            ToolOutput::Text(text) => Self::Text(text),
        }
    }
}

/// Structured outcome of one request.
///
/// `handle` never fails across the boundary; errors surface here as an
/// error payload with the records of every step that reached a terminal
/// outcome.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub success: bool,
    pub payload: ResultPayload,
    pub summary: String,
    pub records: Vec<Arc<InvocationRecord>>,
}

impl DispatchResult {
    fn failed(
        kind: ErrorKind,
        message: String,
        summary: String,
        records: Vec<Arc<InvocationRecord>>,
    ) -> Self {
        Self {
            success: false,
            payload: ResultPayload::Error { kind, message },
            summary,
            records,
        }
    }
}

enum Attempted {
    Success {
        output: ToolOutput,
        record: Arc<InvocationRecord>,
    },
    Failed {
        error: AgentError,
        record: Arc<InvocationRecord>,
    },
    /// The request deadline expired with work in flight; no record is
    /// written for an attempt that never reached a terminal outcome.
    DeadlineExceeded,
}

/// Routes requests to tools and assembles structured results.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    ledger: Arc<ExecutionLedger>,
    classifier: Box<dyn IntentClassifier>,
    retry: RetryConfig,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        ledger: Arc<ExecutionLedger>,
        retry: RetryConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            ledger,
            classifier: Box::new(KeywordClassifier::default()),
            retry,
            request_timeout,
        }
    }

    /// Replaces the classification policy.
    pub fn with_classifier(mut self, classifier: Box<dyn IntentClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Handles one request end to end. Never returns an error; failures are
    /// reported inside the result.
    pub async fn handle(&self, request: DispatchRequest) -> DispatchResult {
        let deadline = Instant::now() + self.request_timeout;

        let chain = match self.plan(&request) {
            Ok(chain) => chain,
            Err(error) => {
                // A bad override still produces a ledger entry, whether or
                // not a handler ran.
                let name = request.tool_override.as_deref().unwrap_or("<none>");
                let record = self.ledger.append(InvocationRecord::failure(
                    name,
                    request.args.clone().unwrap_or(Value::Null),
                    error.kind(),
                    error.to_string(),
                    Utc::now(),
                    0,
                    0,
                ));
                return DispatchResult::failed(
                    error.kind(),
                    error.to_string(),
                    format!("request failed: {error}"),
                    vec![record],
                );
            }
        };

        debug!(
            "Dispatching over {} step(s): [{}]",
            chain.len(),
            chain
                .iter()
                .map(|h| h.descriptor().name)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut records: Vec<Arc<InvocationRecord>> = Vec::with_capacity(chain.len());
        let mut context: Vec<Value> = Vec::new();
        let mut last_output: Option<ToolOutput> = None;

        for (step, handler) in chain.iter().enumerate() {
            let descriptor = handler.descriptor();

            let args = if request.tool_override.is_some() {
                request
                    .args
                    .clone()
                    .unwrap_or(Value::Object(serde_json::Map::new()))
            } else {
                match handler.prepare(&request.text).await {
                    Ok(args) => args,
                    Err(error) => {
                        records.push(self.record_failure(&descriptor.name, Value::Null, &error, 0));
                        return self.chain_failure(step, &descriptor.name, error, records);
                    }
                }
            };

            // Fail fast before the handler sees anything.
            if let Err(error) = validate_input(&descriptor, &args) {
                records.push(self.record_failure(&descriptor.name, args, &error, 0));
                return self.chain_failure(step, &descriptor.name, error, records);
            }

            let input = ToolInput {
                args: args.clone(),
                text: request.text.clone(),
                context: context.clone(),
            };

            match self.invoke_with_retry(handler.as_ref(), &descriptor.name, args, input, deadline).await {
                Attempted::Success { output, record } => {
                    records.push(record);
                    context.push(output.snapshot());
                    last_output = Some(output);
                }
                Attempted::Failed { error, record } => {
                    records.push(record);
                    return self.chain_failure(step, &descriptor.name, error, records);
                }
                Attempted::DeadlineExceeded => {
                    let timeout_ms = self.request_timeout.as_millis() as u64;
                    warn!("Request deadline exceeded at step {} ({})", step + 1, descriptor.name);
                    return DispatchResult::failed(
                        ErrorKind::Timeout,
                        format!("request deadline exceeded after {timeout_ms}ms"),
                        format!(
                            "step {} of {} ({}) cancelled at the request deadline; {} step(s) completed",
                            step + 1,
                            chain.len(),
                            descriptor.name,
                            records.len()
                        ),
                        records,
                    );
                }
            }
        }

        let payload = match last_output {
            Some(output) => ResultPayload::from(output),
            None => ResultPayload::Text(String::new()),
        };
        let summary = records
            .iter()
            .map(|r| format!("{} ok", r.tool_name))
            .collect::<Vec<_>>()
            .join("; ");

        info!("Request completed over {} step(s)", records.len());
        DispatchResult {
            success: true,
            payload,
            summary,
            records,
        }
    }

    /// Resolves the ordered tool chain for a request.
    fn plan(&self, request: &DispatchRequest) -> crate::error::Result<Vec<Arc<dyn ToolHandler>>> {
        if let Some(name) = &request.tool_override {
            return Ok(vec![self.registry.resolve(name)?]);
        }

        let capabilities = self.classifier.classify(&request.text);
        let mut chain: Vec<Arc<dyn ToolHandler>> = capabilities
            .into_iter()
            .filter_map(|cap| self.registry.first_with_capability(cap))
            .collect();

        if chain.is_empty() {
            // No confident match: answer conversationally instead of failing.
            chain.extend(self.registry.first_with_capability(Capability::Completion));
        }

        if chain.is_empty() {
            return Err(AgentError::Internal {
                message: "no tool available to serve the request".into(),
            });
        }

        Ok(chain)
    }

    async fn invoke_with_retry(
        &self,
        handler: &dyn ToolHandler,
        tool_name: &str,
        args: Value,
        input: ToolInput,
        deadline: Instant,
    ) -> Attempted {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut retries: u32 = 0;

        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Attempted::DeadlineExceeded;
            };

            match tokio::time::timeout(remaining, handler.invoke(input.clone())).await {
                Err(_) => return Attempted::DeadlineExceeded,
                Ok(Ok(output)) => {
                    let record = self.ledger.append(InvocationRecord::success(
                        tool_name,
                        args,
                        output.snapshot(),
                        started_at,
                        started.elapsed().as_millis() as u64,
                        retries,
                    ));
                    return Attempted::Success { output, record };
                }
                Ok(Err(error)) => {
                    let retryable = error.is_transient()
                        || (error.kind() == ErrorKind::ToolError && handler.idempotent());

                    if retryable && retries < self.retry.max_retries {
                        let backoff = self.retry.backoff(retries);
                        retries += 1;
                        debug!(
                            "Attempt {} of '{}' failed ({}); retrying in {:?}",
                            retries, tool_name, error, backoff
                        );
                        if Instant::now() + backoff >= deadline {
                            return Attempted::DeadlineExceeded;
                        }
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    let record = self.ledger.append(InvocationRecord::failure(
                        tool_name,
                        args,
                        error.kind(),
                        error.to_string(),
                        started_at,
                        started.elapsed().as_millis() as u64,
                        retries,
                    ));
                    return Attempted::Failed { error, record };
                }
            }
        }
    }

    fn record_failure(
        &self,
        tool_name: &str,
        args: Value,
        error: &AgentError,
        duration_ms: u64,
    ) -> Arc<InvocationRecord> {
        self.ledger.append(InvocationRecord::failure(
            tool_name,
            args,
            error.kind(),
            error.to_string(),
            Utc::now(),
            duration_ms,
            0,
        ))
    }

    fn chain_failure(
        &self,
        step: usize,
        tool_name: &str,
        error: AgentError,
        records: Vec<Arc<InvocationRecord>>,
    ) -> DispatchResult {
        let completed = records.iter().filter(|r| r.success).count();
        warn!("Chain halted at step {} ({}): {}", step + 1, tool_name, error);
        DispatchResult::failed(
            error.kind(),
            error.to_string(),
            format!(
                "step {} ({}) failed after {} successful step(s): {}",
                step + 1,
                tool_name,
                completed,
                error
            ),
            records,
        )
    }
}
