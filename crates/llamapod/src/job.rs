//! Serverless job handler.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use log::error;
use serde_json::Value;

use llamapod_protocol::{Job, JobOutput};

use crate::proxy::CompletionProxy;

/// Turns jobs into completion calls.
#[derive(Debug, Clone)]
pub struct JobHandler {
    proxy: CompletionProxy,
}

impl JobHandler {
    pub fn new(proxy: CompletionProxy) -> Self {
        Self { proxy }
    }

    pub fn proxy(&self) -> &CompletionProxy {
        &self.proxy
    }

    /// Handle a parsed job. Never panics and never fails; every problem is
    /// reported through the error output.
    pub async fn handle(&self, job: &Job) -> JobOutput {
        let request = job.input.to_completion_request();
        match AssertUnwindSafe(self.proxy.complete(&request))
            .catch_unwind()
            .await
        {
            Ok(result) => result.into(),
            Err(panic) => {
                let cause = panic_message(panic.as_ref());
                error!("An unexpected error occurred in handler: {}", cause);
                JobOutput::error(format!("unexpected error: {cause}"))
            }
        }
    }

    /// Handle a raw job document.
    pub async fn handle_value(&self, raw: Value) -> JobOutput {
        match serde_json::from_value::<Job>(raw) {
            Ok(job) => self.handle(&job).await,
            Err(e) => JobOutput::error(format!("invalid job input: {e}")),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
