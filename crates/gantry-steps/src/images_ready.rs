//! Sentinel step marking every configured output image as pushed.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use gantry_core::step::Step;
use gantry_core::{Result, StepLink};

pub struct ImagesReadyStep {
    requires: Vec<StepLink>,
}

impl ImagesReadyStep {
    pub fn new(output_links: Vec<StepLink>) -> Self {
        Self {
            requires: crate::dedup_links(output_links),
        }
    }
}

#[async_trait]
impl Step for ImagesReadyStep {
    fn name(&self) -> &str {
        "[images]"
    }

    fn requires(&self) -> Vec<StepLink> {
        self.requires.clone()
    }

    fn creates(&self) -> Vec<StepLink> {
        vec![StepLink::ImagesReady]
    }

    async fn run(&self, _token: &CancellationToken) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_on_every_output() {
        let step = ImagesReadyStep::new(vec![
            StepLink::external("ci", "tools", "latest"),
            StepLink::external("ci", "tools", "latest"),
            StepLink::external("ci", "cli", "latest"),
        ]);
        assert_eq!(step.requires().len(), 2);
        assert_eq!(step.creates(), vec![StepLink::ImagesReady]);
    }
}
