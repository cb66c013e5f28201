//! llamapod: a serverless worker for `llama_cpp.server`.
//!
//! Bring-up ([`runner`]) installs dependencies, downloads the model, writes
//! the server config, launches the server and waits for `/health`. After
//! that, jobs ([`job`], [`api`]) are proxied to the server's chat endpoint
//! ([`proxy`]).

pub mod api;
pub mod health;
pub mod job;
pub mod process;
pub mod proxy;
pub mod runner;
pub mod server_config;
pub mod settings;
pub mod setup;

pub use runner::{InitError, Initializer, Runner, RunnerState, initialize};
pub use settings::{Settings, SettingsError};
