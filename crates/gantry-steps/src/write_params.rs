//! Terminal step writing every resolved parameter to a file.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use gantry_core::params::ParameterStore;
use gantry_core::step::Step;
use gantry_core::{Error, Result, StepLink};

pub struct WriteParametersStep {
    path: PathBuf,
    params: Arc<ParameterStore>,
}

impl WriteParametersStep {
    pub fn new(path: PathBuf, params: Arc<ParameterStore>) -> Self {
        Self { path, params }
    }
}

#[async_trait]
impl Step for WriteParametersStep {
    fn name(&self) -> &str {
        "[output:parameters]"
    }

    /// Runs after everything else, and specifically after every
    /// producer a registered parameter hinted at.
    fn requires(&self) -> Vec<StepLink> {
        let mut links = vec![StepLink::AllSteps];
        links.extend(self.params.links());
        links
    }

    fn creates(&self) -> Vec<StepLink> {
        Vec::new()
    }

    async fn run(&self, _token: &CancellationToken) -> Result<()> {
        let values = self.params.map().await?;
        let content = format_parameters(&values);
        info!(path = %self.path.display(), count = values.len(), "writing parameters");
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| Error::Internal(format!("writing {}: {e}", self.path.display())))
    }
}

/// `KEY=VALUE` lines, sorted by key, trailing newline. Values with
/// characters outside `[A-Za-z0-9_.\-]` are single-quoted with `'` and
/// `\` escaped.
pub fn format_parameters(values: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in values {
        out.push_str(key);
        out.push('=');
        if needs_quoting(value) {
            out.push('\'');
            for c in value.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '\'' => out.push_str("\\'"),
                    _ => out.push(c),
                }
            }
            out.push('\'');
        } else {
            out.push_str(value);
        }
        out.push('\n');
    }
    out
}

fn needs_quoting(value: &str) -> bool {
    value
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
}
