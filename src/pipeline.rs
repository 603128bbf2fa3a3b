// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ordered execution of [`Checker`]s across the three exchange phases.

use std::sync::Arc;

use crate::checkers::{Checker, CheckerFactory};
use crate::core::{Exchange, InboundRequest, ProxyError, UpstreamResponse};
use crate::debug_fmt;

/// Checkers in the order they run.  Built once at startup.
#[derive(Debug, Clone)]
pub struct Pipeline {
    checkers: Vec<Arc<dyn Checker>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::standard()
    }
}

impl Pipeline {
    pub fn new(checkers: Vec<Arc<dyn Checker>>) -> Self {
        Self { checkers }
    }

    /// The built-in checkers.
    pub fn standard() -> Self {
        Self::new(CheckerFactory::standard())
    }

    /// Append a checker after the existing ones.
    pub fn push(&mut self, checker: Arc<dyn Checker>) {
        self.checkers.push(checker);
    }

    pub fn checkers(&self) -> &[Arc<dyn Checker>] {
        &self.checkers
    }

    /// Request phase.  The first error stops the pipeline.
    pub async fn on_request(
        &self,
        exchange: &Exchange,
        mut request: InboundRequest,
    ) -> Result<InboundRequest, ProxyError> {
        for checker in self.checkers.iter().filter(|c| c.phase().is_request()) {
            request = checker.on_request(exchange, request).await.inspect_err(|e| {
                debug_fmt!(
                    "Pipeline",
                    "[{}] {} rejected request: {}",
                    exchange.trace_id,
                    checker.name(),
                    e
                );
            })?;
        }
        Ok(request)
    }

    /// Response phase, before any body bytes are relayed.
    pub async fn on_remote_response(
        &self,
        exchange: &Exchange,
        response: &mut UpstreamResponse,
    ) -> Result<(), ProxyError> {
        for checker in self.checkers.iter().filter(|c| c.phase().is_response()) {
            checker
                .on_remote_response(exchange, response)
                .await
                .inspect_err(|e| {
                    debug_fmt!(
                        "Pipeline",
                        "[{}] {} rejected response: {}",
                        exchange.trace_id,
                        checker.name(),
                        e
                    );
                })?;
        }
        Ok(())
    }

    /// Finish phase.  Every checker runs, also for requests that never
    /// named a usable target (`None`).
    pub async fn on_finish(&self, exchange: Option<&Exchange>) {
        for checker in &self.checkers {
            checker.on_finish(exchange).await;
        }
    }
}
