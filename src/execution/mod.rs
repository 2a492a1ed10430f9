pub mod native;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, warn};

use crate::tools::schema::ParameterSchema;
use crate::tools::{ToolCall, ToolName};

pub use self::native::NativeToolRegistry;

#[derive(Debug, Error)]
pub enum ToolRegistryError {
    #[error("tool '{0}' is not available in this registry")]
    Unsupported(ToolName),
    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub image: Vec<u8>,
}

/// Boundary to the concrete pixel implementations. Resolves each `ToolCall`
/// variant to an implementation; invoked once per attempt.
pub trait ToolRegistry: Send + Sync + 'static {
    fn describe(&self, tool: ToolName) -> ParameterSchema {
        tool.schema()
    }

    fn invoke(&self, call: &ToolCall, image: &[u8]) -> Result<ToolOutput, ToolRegistryError>;
}

pub type SharedToolRegistry = Arc<dyn ToolRegistry>;

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(skip)]
    pub result_image: Option<Arc<[u8]>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn succeeded(image: Vec<u8>, duration: Duration) -> Self {
        Self {
            success: true,
            result_image: Some(Arc::from(image)),
            error: None,
            duration,
        }
    }

    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            result_image: None,
            error: Some(error.into()),
            duration,
        }
    }
}

pub(crate) fn serialize_duration_ms<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis().min(u128::from(u64::MAX)) as u64)
}

#[derive(Clone)]
pub struct ToolExecutionAdapter {
    registry: SharedToolRegistry,
    timeout: Duration,
}

impl ToolExecutionAdapter {
    pub fn new(registry: SharedToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &SharedToolRegistry {
        &self.registry
    }

    /// Invokes the registry exactly once. Errors, panics and overruns of the
    /// per-attempt timeout all come back as a failed `ExecutionOutcome`.
    pub async fn execute(&self, call: ToolCall, image: Arc<[u8]>) -> ExecutionOutcome {
        let tool = call.tool();
        let started = Instant::now();
        let registry = self.registry.clone();
        let task = tokio::task::spawn_blocking(move || {
            std::panic::catch_unwind(AssertUnwindSafe(|| registry.invoke(&call, &image)))
        });
        let joined = tokio::time::timeout(self.timeout, task).await;
        let duration = started.elapsed();

        let outcome = match joined {
            Err(_) => ExecutionOutcome::failed(
                format!(
                    "{tool} execution timed out after {}ms",
                    self.timeout.as_millis()
                ),
                duration,
            ),
            Ok(Err(join_error)) => {
                ExecutionOutcome::failed(format!("{tool} task aborted: {join_error}"), duration)
            }
            Ok(Ok(Err(panic))) => ExecutionOutcome::failed(
                format!("{tool} panicked: {}", panic_message(panic.as_ref())),
                duration,
            ),
            Ok(Ok(Ok(Err(error)))) => ExecutionOutcome::failed(error.to_string(), duration),
            Ok(Ok(Ok(Ok(output)))) if output.image.is_empty() => {
                ExecutionOutcome::failed(format!("{tool} returned an empty image"), duration)
            }
            Ok(Ok(Ok(Ok(output)))) => ExecutionOutcome::succeeded(output.image, duration),
        };

        match outcome.error.as_deref() {
            None => debug!(
                tool = %tool,
                duration_ms = duration.as_millis() as u64,
                "tool execution succeeded"
            ),
            Some(error) => warn!(
                tool = %tool,
                duration_ms = duration.as_millis() as u64,
                error,
                "tool execution failed"
            ),
        }
        outcome
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    String::from("unknown panic payload")
}
