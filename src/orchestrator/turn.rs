use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use super::{BatchReport, ConversationContext, RunControl, ToolCallReport, ToolCallRunner};
use crate::tools::ToolCallProposal;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum ProposalSourceError {
    #[error("proposal source unavailable: {0}")]
    Unavailable(String),
    #[error("proposal source returned an unusable response: {0}")]
    InvalidResponse(String),
}

/// The model that turns a user message into tool call proposals.
pub trait ProposalSource: Send + Sync {
    fn propose<'a>(
        &'a self,
        context: &'a ConversationContext,
        image: &'a [u8],
    ) -> BoxFuture<'a, Result<Vec<ToolCallProposal>, ProposalSourceError>>;

    fn summarize<'a>(
        &'a self,
        context: &'a ConversationContext,
        batch: &'a BatchReport,
    ) -> BoxFuture<'a, Result<String, ProposalSourceError>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub request_id: String,
    pub batch: BatchReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal_error: Option<String>,
}

impl TurnReport {
    pub fn reports(&self) -> &[ToolCallReport] {
        &self.batch.reports
    }
}

/// One user turn: a single `propose`, the batch of tool calls, then a
/// single `summarize` once every call has resolved.
#[derive(Clone)]
pub struct TurnRunner {
    runner: ToolCallRunner,
    source: Arc<dyn ProposalSource>,
}

impl TurnRunner {
    pub fn new(runner: ToolCallRunner, source: Arc<dyn ProposalSource>) -> Self {
        Self { runner, source }
    }

    pub fn runner(&self) -> &ToolCallRunner {
        &self.runner
    }

    pub async fn run_turn(
        &self,
        context: &ConversationContext,
        image: Arc<[u8]>,
        max_retries: u32,
        control: &RunControl,
    ) -> TurnReport {
        let proposals = match control.guard(self.source.propose(context, &image)).await {
            Ok(Ok(proposals)) => proposals,
            Ok(Err(error)) => {
                warn!(request_id = %context.request_id, error = %error, "proposal source failed");
                return TurnReport {
                    request_id: context.request_id.clone(),
                    batch: unanswered_batch(),
                    summary: None,
                    proposal_error: Some(error.to_string()),
                };
            }
            Err(reason) => {
                return TurnReport {
                    request_id: context.request_id.clone(),
                    batch: unanswered_batch(),
                    summary: None,
                    proposal_error: Some(reason.to_string()),
                };
            }
        };
        info!(
            request_id = %context.request_id,
            proposals = proposals.len(),
            "proposal source returned tool calls"
        );

        let batch = self
            .runner
            .run_batch(proposals, image, context, max_retries, control)
            .await;

        let summary = match control.guard(self.source.summarize(context, &batch)).await {
            Ok(Ok(summary)) => Some(summary),
            Ok(Err(error)) => {
                warn!(request_id = %context.request_id, error = %error, "summary request failed");
                None
            }
            Err(reason) => {
                warn!(request_id = %context.request_id, reason = %reason, "summary request interrupted");
                None
            }
        };

        TurnReport {
            request_id: context.request_id.clone(),
            batch,
            summary,
            proposal_error: None,
        }
    }
}

fn unanswered_batch() -> BatchReport {
    BatchReport {
        reports: Vec::new(),
        all_succeeded: false,
        confidence: 0,
    }
}
