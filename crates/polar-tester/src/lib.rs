//! Prompt-testing harness for Polar authorization policies.
//!
//! polar-tester turns a plain-language authorization requirement into a
//! Polar policy with an LLM, checks the result with an external validator
//! (`oso-cloud validate` by default), and feeds the validator's complaint
//! back to the model until the policy passes or the attempt budget runs
//! out. Every step of a session is recorded in an append-only event log
//! that can be replayed to rebuild the session's state.
//!
//! # Where to find things
//!
//! - **Build a prompt**: [`prompt::assemble`] combines context documents,
//!   the requirement, and an optional failed attempt into a
//!   [`GenerationRequest`].
//! - **Talk to a model**: implement [`ModelClient`], or use [`ChatClient`]
//!   for any OpenAI-compatible endpoint.
//! - **Check a policy**: [`CliValidator`] runs an external checker on a
//!   temporary `.polar` file.
//! - **Generate with retries**: [`Generator::generate`] runs the
//!   generate/validate/correct loop and reports progress to a
//!   [`GenerationObserver`].
//! - **Keep history**: [`SessionManager`] creates sessions and records each
//!   edit and generation as [`SessionEvent`]s in an [`EventLog`].
//!   [`SessionManager::backup_session`] and
//!   [`SessionManager::restore_backup`] roll a session back.
//! - **Choose storage**: [`LocalStore`] for a directory tree,
//!   [`ObjectStoreBackend`] for S3 or in-memory stores.
//! - **Configure**: [`AppConfig::load`] layers defaults, a TOML file, and
//!   `POLAR_TESTER_*` environment variables.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`prompt`] | Prompt assembly, code-fence stripping, context loading |
//! | [`client`] | `ModelClient` trait and the HTTP chat client |
//! | [`validator`] | `Validator` trait and the subprocess validator |
//! | [`generate`] | Generation-retry loop and its observers |
//! | [`events`] | Event types, JSONL log, replay |
//! | [`store`] | `SessionStore` trait with local and object-store backends |
//! | [`session`] | Session lifecycle, backups, and scans on top of the store and log |
//! | [`config`] | Layered configuration |
//! | [`error`] | Error types |

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod generate;
mod locks;
pub mod prompt;
pub mod session;
pub mod store;
pub mod validator;

pub use client::{ChatClient, ChatClientConfig, Completion, ModelClient};
pub use config::AppConfig;
pub use error::{ConfigError, Error, Result, StoreError};
pub use events::{EventLog, EventType, Session, SessionEvent, SessionStats};
pub use generate::{GenerateConfig, GenerationObserver, GenerationResult, Generator};
pub use prompt::{GenerationRequest, ModelOverrides};
pub use session::{BackupInfo, ScanReport, SessionManager, SessionSummary};
pub use store::{LocalStore, ObjectStoreBackend, SessionStore};
pub use validator::{CliValidator, Validation, Validator};
