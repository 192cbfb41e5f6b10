//! Contact form submission over HTTP.

use std::time::Duration;

use outreach_core::{FormSubmitter, SubmissionPlan, SubmissionReceipt};
use outreach_shared::{Result, StageError};
use reqwest::{Client, StatusCode};
use tracing::{info, instrument};

use crate::http::{
    MAX_RESPONSE_BYTES, build_client, checked_url, excerpt, read_body, send_error, status_error,
};

pub struct HttpFormSubmitter {
    client: Client,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_localhost: bool,
}

impl HttpFormSubmitter {
    /// `timeout` bounds each HTTP request.
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::build(timeout, false)
    }

    /// Allow localhost/private IPs, redirects included (for integration tests).
    #[cfg(test)]
    pub fn allowing_localhost(timeout: Duration) -> Result<Self> {
        Self::build(timeout, true)
    }

    fn build(timeout: Duration, allow_localhost: bool) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout, allow_localhost)?,
            allow_localhost,
        })
    }
}

impl FormSubmitter for HttpFormSubmitter {
    /// POST sends the payload url-encoded in the body, GET as the query.
    ///
    /// Rate limits and server errors are retried; any other answer is a
    /// receipt, with `success` set for 2xx after redirects.
    #[instrument(skip_all, fields(target = %plan.submit_url, method = %plan.method))]
    async fn submit(&self, plan: &SubmissionPlan) -> std::result::Result<SubmissionReceipt, StageError> {
        let url = checked_url(&plan.submit_url, self.allow_localhost)?;
        let request = if plan.method == "get" {
            self.client.get(url.as_str()).query(&plan.payload)
        } else {
            self.client.post(url.as_str()).form(&plan.payload)
        };

        let response = request.send().await.map_err(|e| send_error(&url, e))?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            return Err(status_error(&url, &response));
        }

        let response_url = response.url().to_string();
        let body = read_body(&url, response, MAX_RESPONSE_BYTES)
            .await
            .unwrap_or_default();
        info!(status = status.as_u16(), fields = plan.payload.len(), "form submitted");
        Ok(SubmissionReceipt {
            success: status.is_success(),
            status_code: status.as_u16(),
            response_url,
            excerpt: excerpt(&body),
        })
    }
}
