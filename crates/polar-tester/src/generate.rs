//! The generation-retry loop.
//!
//! [`Generator::generate`] asks the model for a candidate, validates it, and
//! on a syntax failure regenerates with the validator's message fed back, up
//! to [`GenerateConfig::max_attempts`] calls in total. A final failing
//! validation is returned as data in the [`GenerationResult`]; only an
//! unusable model or validator produces an error.
//!
//! # Observing a run
//!
//! | Observer | Use case |
//! |----------|----------|
//! | [`NoopObserver`] | Tests or fire-and-forget runs |
//! | [`LoggingObserver`] | Structured logging via `tracing` |
//! | [`FnObserver`] | Quick closures (the CLI's progress lines) |

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::client::ModelClient;
use crate::error::{Error, Result};
use crate::prompt::{GenerationRequest, strip_code_fence};
use crate::validator::{Validation, Validator};

/// Default number of model calls per generation (first try + one retry).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Loop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateConfig {
    /// Total model calls allowed, including the first. Must be ≥ 1.
    pub max_attempts: u32,
    /// Upper bound on a single model call. `None` leaves it to the client.
    pub model_timeout: Option<Duration>,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            model_timeout: Some(Duration::from_secs(180)),
        }
    }
}

/// One model call and its validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    /// Candidate policy text, fences stripped.
    pub candidate: String,
    pub outcome: Validation,
    /// The validator message this attempt was asked to fix.
    pub prior_error: Option<String>,
    pub tokens: Option<u32>,
}

/// Final output of a generation run.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Text of the last candidate.
    pub text: String,
    /// Validation outcome of the last candidate.
    pub outcome: Validation,
    /// Number of model calls made (1..=max_attempts).
    pub attempts: u32,
    pub history: Vec<Attempt>,
    /// Total tokens across attempts, when the provider reported usage.
    pub tokens_used: Option<u32>,
    /// Model that produced the last candidate, when reported.
    pub model: Option<String>,
    pub elapsed: Duration,
}

impl GenerationResult {
    pub fn passed(&self) -> bool {
        self.outcome.is_pass()
    }
}

// ── Observer ───────────────────────────────────────────────────────

/// Progress notifications emitted by [`Generator::generate`].
#[derive(Debug)]
pub enum GenerationEvent<'a> {
    AttemptStarted {
        attempt: u32,
        max_attempts: u32,
        correction: bool,
    },
    CandidateReceived {
        attempt: u32,
        text: &'a str,
        tokens: Option<u32>,
    },
    Validated {
        attempt: u32,
        outcome: &'a Validation,
    },
    RetryScheduled {
        next_attempt: u32,
        error: &'a str,
    },
    Finished {
        result: &'a GenerationResult,
    },
}

/// Receives [`GenerationEvent`]s. The default ignores everything.
pub trait GenerationObserver: Send + Sync {
    fn on_event(&self, event: &GenerationEvent<'_>) {
        let _ = event;
    }
}

pub struct NoopObserver;
impl GenerationObserver for NoopObserver {}

/// Logs each transition through `tracing`.
pub struct LoggingObserver;

impl GenerationObserver for LoggingObserver {
    fn on_event(&self, event: &GenerationEvent<'_>) {
        match event {
            GenerationEvent::AttemptStarted {
                attempt,
                max_attempts,
                correction,
            } => info!(
                "Attempt {attempt}/{max_attempts}{}",
                if *correction { " (correction)" } else { "" }
            ),
            GenerationEvent::CandidateReceived { text, tokens, .. } => {
                debug!("Candidate: {} bytes, tokens={tokens:?}", text.len())
            }
            GenerationEvent::Validated { attempt, outcome } => match outcome {
                Validation::Pass => info!("Attempt {attempt} passed validation"),
                Validation::Fail { message } => {
                    warn!("Attempt {attempt} failed validation: {message}")
                }
            },
            GenerationEvent::RetryScheduled { next_attempt, .. } => {
                info!("Retrying with validator feedback (attempt {next_attempt})")
            }
            GenerationEvent::Finished { result } => info!(
                "Generation finished: passed={}, attempts={}, {:.1}s",
                result.passed(),
                result.attempts,
                result.elapsed.as_secs_f64()
            ),
        }
    }
}

/// Observer backed by a closure.
pub struct FnObserver<F>(F)
where
    F: Fn(&GenerationEvent<'_>) + Send + Sync;

impl<F> FnObserver<F>
where
    F: Fn(&GenerationEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> GenerationObserver for FnObserver<F>
where
    F: Fn(&GenerationEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &GenerationEvent<'_>) {
        (self.0)(event)
    }
}

// ── Generator ──────────────────────────────────────────────────────

/// Drives one generate → validate → (retry) run.
pub struct Generator {
    model: Arc<dyn ModelClient>,
    validator: Arc<dyn Validator>,
    config: GenerateConfig,
    observer: Arc<dyn GenerationObserver>,
}

impl Generator {
    pub fn new(model: Arc<dyn ModelClient>, validator: Arc<dyn Validator>) -> Self {
        Self {
            model,
            validator,
            config: GenerateConfig::default(),
            observer: Arc::new(LoggingObserver),
        }
    }

    pub fn with_config(mut self, config: GenerateConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: impl GenerationObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    pub fn config(&self) -> &GenerateConfig {
        &self.config
    }

    /// Run the loop. At most one model call or validator run is in flight.
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
        let max_attempts = self.config.max_attempts;
        if max_attempts == 0 {
            return Err(Error::Configuration("max_attempts must be at least 1".into()));
        }

        let start = Instant::now();
        let mut request = request;
        let mut history: Vec<Attempt> = Vec::new();
        let mut tokens_used: Option<u32> = None;
        let mut model = None;

        for number in 1..=max_attempts {
            self.observer.on_event(&GenerationEvent::AttemptStarted {
                attempt: number,
                max_attempts,
                correction: request.is_correction(),
            });

            let completion = self.call_model(&request).await?;
            let candidate = strip_code_fence(&completion.text);
            if candidate.is_empty() {
                return Err(Error::Model(format!(
                    "model returned an empty response on attempt {number}"
                )));
            }
            let tokens = completion.usage.as_ref().map(|u| u.total());
            if let Some(t) = tokens {
                tokens_used = Some(tokens_used.unwrap_or(0).saturating_add(t));
            }
            if completion.model.is_some() {
                model = completion.model;
            }
            self.observer.on_event(&GenerationEvent::CandidateReceived {
                attempt: number,
                text: &candidate,
                tokens,
            });

            let outcome = self.validator.validate(&candidate).await?;
            self.observer.on_event(&GenerationEvent::Validated {
                attempt: number,
                outcome: &outcome,
            });

            let next = match (&outcome, number < max_attempts) {
                (Validation::Fail { message }, true) => Some(request.retry(&candidate, message)),
                _ => None,
            };
            history.push(Attempt {
                number,
                candidate,
                outcome,
                prior_error: request.prior_error().map(str::to_string),
                tokens,
            });

            match next {
                Some(retry) => {
                    self.observer.on_event(&GenerationEvent::RetryScheduled {
                        next_attempt: number + 1,
                        error: retry.prior_error().unwrap_or_default(),
                    });
                    request = retry;
                }
                None => break,
            }
        }

        let last = history
            .last()
            .cloned()
            .ok_or_else(|| Error::Model("no attempt was made".into()))?;
        let result = GenerationResult {
            text: last.candidate,
            outcome: last.outcome,
            attempts: last.number,
            history,
            tokens_used,
            model,
            elapsed: start.elapsed(),
        };
        self.observer
            .on_event(&GenerationEvent::Finished { result: &result });
        Ok(result)
    }

    async fn call_model(&self, request: &GenerationRequest) -> Result<crate::client::Completion> {
        let call = self.model.complete(request);
        match self.config.model_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                Error::Model(format!("model call timed out after {:.1}s", limit.as_secs_f64()))
            })?,
            None => call.await,
        }
    }
}
