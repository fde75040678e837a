//! Per-message pipeline: decode the payload, generate a script from the prompt, execute it, log the result.
//!
//! `Pipeline::handle` never returns an error; every failure ends the message with a log entry.
//! `run_dispatcher` runs one pipeline task per inbound message with a bounded number in flight.

use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::channels::InboundMessage;
use crate::config::Config;
use crate::exec::{ExecutionResult, ScriptExecutor, ShellExecutor};
use crate::llm::{GenerationClient, GenerationError, ScriptGenerator};

/// Decoded message payload: `{"prompt": "..."}`.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptPayload {
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Last stage a message reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Decoded,
    Generated,
    Executed,
    Done,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("empty prompt")]
    EmptyPrompt,
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

/// How one message ended.
#[derive(Debug)]
pub enum Outcome {
    /// Script ran; `result.error` says whether it succeeded.
    Done(ExecutionResult),
    /// Stopped before execution. `stage` is the last stage reached.
    Aborted { stage: Stage, error: PipelineError },
}

impl Outcome {
    pub fn stage(&self) -> Stage {
        match self {
            Outcome::Done(_) => Stage::Done,
            Outcome::Aborted { stage, .. } => *stage,
        }
    }
}

/// Generator plus executor. Holds no per-message state, so one instance serves all concurrent messages.
#[derive(Clone)]
pub struct Pipeline {
    generator: Arc<dyn ScriptGenerator>,
    executor: Arc<dyn ScriptExecutor>,
}

impl Pipeline {
    pub fn new(generator: Arc<dyn ScriptGenerator>, executor: Arc<dyn ScriptExecutor>) -> Self {
        Self {
            generator,
            executor,
        }
    }

    /// HTTP generation client and shell executor built from config.
    pub fn from_config(config: &Config) -> Result<Self, GenerationError> {
        let generator = GenerationClient::from_config(&config.generation)?;
        let executor = ShellExecutor::new(config.execution.shell.clone());
        Ok(Self::new(Arc::new(generator), Arc::new(executor)))
    }

    /// Process one message to completion.
    pub async fn handle(&self, msg: &InboundMessage) -> Outcome {
        log::info!(
            "received message on topic {}: {}",
            msg.topic,
            String::from_utf8_lossy(&msg.payload)
        );

        let prompt = match decode_prompt(&msg.payload) {
            Ok(p) => p,
            Err(error) => {
                let stage = match error {
                    PipelineError::EmptyPrompt => {
                        log::info!("empty prompt received, ignoring");
                        Stage::Decoded
                    }
                    _ => {
                        log::warn!("dropping message: {}", error);
                        Stage::Received
                    }
                };
                return Outcome::Aborted { stage, error };
            }
        };

        log::info!("requesting script for prompt: {}", prompt);
        let script = match self.generator.generate(&prompt).await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("dropping message: {}", e);
                return Outcome::Aborted {
                    stage: Stage::Decoded,
                    error: e.into(),
                };
            }
        };

        log::info!("executing script: {}", script);
        let result = self.executor.execute(&script).await;
        log::info!("script output:\n{}", result.output_lossy());

        match &result.error {
            None => log::info!("script executed successfully"),
            Some(e) => log::warn!("script execution failed: {}", e),
        }
        Outcome::Done(result)
    }
}

/// Parse the payload and return the prompt. Missing, null, and `""` prompts are not actionable.
pub fn decode_prompt(payload: &[u8]) -> Result<String, PipelineError> {
    let decoded: PromptPayload = serde_json::from_slice(payload)?;
    match decoded.prompt {
        Some(p) if !p.is_empty() => Ok(p),
        _ => Err(PipelineError::EmptyPrompt),
    }
}

/// Run the pipeline for every message from `inbound_rx`, at most `max_concurrency` at a time.
/// Receiving never waits for a free slot; each task waits for its own permit, so the queue keeps
/// draining while scripts run. Returns after the channel closes and all in-flight messages finished.
pub async fn run_dispatcher(
    pipeline: Arc<Pipeline>,
    mut inbound_rx: mpsc::Receiver<InboundMessage>,
    max_concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut tasks = JoinSet::new();
    while let Some(msg) = inbound_rx.recv().await {
        let pipeline = pipeline.clone();
        let permits = permits.clone();
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            pipeline.handle(&msg).await;
        });
        while let Some(res) = tasks.try_join_next() {
            log_task_result(res);
        }
    }
    log::debug!("dispatcher: inbound channel closed, waiting for {} task(s)", tasks.len());
    while let Some(res) = tasks.join_next().await {
        log_task_result(res);
    }
    log::info!("dispatcher stopped");
}

fn log_task_result(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        log::warn!("pipeline task failed: {}", e);
    }
}
