//! Upload of crash reports and on-demand diagnostics
//!
//! Uploads are best effort: a failure is logged and retried on a later pass.

use super::context::SyncContext;
use super::execution::Execution;
use super::types::{EntityName, EntitySynchronizer, SyncType};
use crate::client::RawClient;
use crate::diagnostic::{DiagnosticFile, DiagnosticKind};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const UPLOAD_PATH: &str = "v1/gloutondiagnostic/";

#[derive(Debug, Deserialize)]
struct RemoteDiagnostic {
    name: String,
}

/// A `multipart/form-data` body built in memory
pub(crate) struct MultipartBody {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartBody {
    pub fn new() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(30)
            .map(char::from)
            .collect();

        Self {
            boundary: format!("----diagnostic{}", suffix),
            body: Vec::new(),
        }
    }

    fn part_header(&mut self, disposition: &str) {
        self.body.extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.body
            .extend_from_slice(format!("Content-Disposition: form-data; {}\r\n", disposition).as_bytes());
    }

    pub fn field(mut self, name: &str, value: &str) -> Self {
        self.part_header(&format!("name=\"{}\"", name));
        self.body.extend_from_slice(b"\r\n");
        self.body.extend_from_slice(value.as_bytes());
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn file(mut self, name: &str, filename: &str, content: &[u8]) -> Self {
        self.part_header(&format!("name=\"{}\"; filename=\"{}\"", name, filename));
        self.body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        self.body.extend_from_slice(content);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn finish(mut self) -> (String, Vec<u8>) {
        self.body.extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        (self.content_type(), self.body)
    }
}

pub(crate) struct DiagnosticSync {
    ctx: Arc<SyncContext>,
    /// Diagnostics already tried by this process, retried on full passes only
    attempted: HashSet<String>,
}

impl DiagnosticSync {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            attempted: HashSet::new(),
        }
    }

    /// Crash reports not marked uploaded, and the pending on-demand diagnostic.
    fn local_diagnostics(&self) -> Vec<DiagnosticFile> {
        let uploaded = self.ctx.cache.uploaded_diagnostics();

        let mut diagnostics: Vec<DiagnosticFile> = match &self.ctx.diagnostics {
            Some(source) => match source.crash_reports() {
                Ok(reports) => reports,
                Err(e) => {
                    debug!(error = %e, "Unable to list crash reports");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        diagnostics.retain(|d| !uploaded.contains(&d.filename));

        if let Some(on_demand) = self.ctx.shared.on_demand_diagnostic() {
            diagnostics.push(on_demand);
        }

        diagnostics
    }

    fn mark_uploaded(&self, diagnostic: &DiagnosticFile) {
        match diagnostic.kind {
            DiagnosticKind::Crash => self.ctx.cache.mark_diagnostic_uploaded(diagnostic.filename.clone()),
            DiagnosticKind::OnDemand => self.ctx.shared.clear_on_demand_diagnostic(&diagnostic.filename),
        }
    }

    async fn upload(&self, client: &dyn RawClient, diagnostic: &DiagnosticFile) -> Result<()> {
        let size = diagnostic.size()?;
        if size > self.ctx.config.max_diagnostic_size {
            warn!(
                diagnostic = %diagnostic.filename,
                size = size,
                "Diagnostic is too big, skipping its upload"
            );
            self.mark_uploaded(diagnostic);
            return Ok(());
        }

        let content = diagnostic.read()?;
        let mut body = MultipartBody::new().field("type", &diagnostic.kind.as_api_type().to_string());
        if !diagnostic.request_token.is_empty() {
            body = body.field("request_token", &diagnostic.request_token);
        }
        let (content_type, body) = body.file("archive", &diagnostic.filename, &content).finish();

        let status = client
            .do_with_body(UPLOAD_PATH, &content_type, body)
            .await
            .context("Upload request failed")?;

        if status != 201 {
            bail!("upload failed with status {}", status);
        }

        info!(diagnostic = %diagnostic.filename, "Diagnostic uploaded");
        self.mark_uploaded(diagnostic);
        Ok(())
    }
}

#[async_trait]
impl EntitySynchronizer for DiagnosticSync {
    fn name(&self) -> EntityName {
        EntityName::Diagnostics
    }

    fn enabled_in_suspended_mode(&self) -> bool {
        false
    }

    async fn prepare_execution(&mut self, execution: &Execution) -> Result<bool> {
        Ok(!execution.is_only_essential())
    }

    async fn need_synchronization(&mut self, _execution: &Execution) -> bool {
        self.local_diagnostics()
            .iter()
            .any(|d| !self.attempted.contains(&d.filename))
    }

    async fn refresh_cache(&mut self, _execution: &Execution, _sync_type: SyncType) -> Result<()> {
        Ok(())
    }

    async fn sync_remote_and_local(&mut self, execution: &Execution, _sync_type: SyncType) -> Result<()> {
        let local = self.local_diagnostics();
        if local.is_empty() {
            return Ok(());
        }

        let remote: HashSet<String> = execution
            .client()
            .iter("gloutondiagnostic", &[("agent", &self.ctx.agent_id)])
            .await
            .context("Failed to list remote diagnostics")?
            .into_iter()
            .filter_map(|raw| serde_json::from_value::<RemoteDiagnostic>(raw).ok())
            .map(|d| d.name)
            .collect();

        for diagnostic in local {
            self.attempted.insert(diagnostic.filename.clone());

            if remote.contains(&diagnostic.filename) {
                self.mark_uploaded(&diagnostic);
                continue;
            }

            // Remaining uploads wait for a later pass
            if let Err(e) = self.upload(execution.client(), &diagnostic).await {
                warn!(diagnostic = %diagnostic.filename, error = %e, "Failed to upload diagnostic");
                break;
            }
        }

        Ok(())
    }
}
