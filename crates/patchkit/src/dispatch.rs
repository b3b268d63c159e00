//! Routing of module load notifications to their batches

use std::collections::HashMap;

use tracing::{debug, info};

use crate::batch::{Batch, BatchReport, ResolutionTable};
use crate::error::{Error, Result};
use crate::host::HostServices;
use crate::image::ModuleImage;

/// Runs each registered batch exactly once, when its module loads.
#[derive(Debug, Default)]
pub struct LoadDispatcher {
    batches: HashMap<String, Batch>,
    resolved: HashMap<String, ResolutionTable>,
}

impl LoadDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the batch for a module identifier, replacing any previous one
    pub fn register(&mut self, module: impl Into<String>, batch: Batch) -> &mut Self {
        self.batches.insert(module.into(), batch);
        self
    }

    pub fn is_registered(&self, module: &str) -> bool {
        self.batches.contains_key(module)
    }

    pub fn is_processed(&self, module: &str) -> bool {
        self.resolved.contains_key(module)
    }

    /// Addresses resolved for a processed module, including partial results
    /// of a failed batch
    pub fn resolved(&self, module: &str) -> Option<&ResolutionTable> {
        self.resolved.get(module)
    }

    /// Handle one load notification.
    ///
    /// Returns `Ok(None)` for modules nobody registered for. A second
    /// notification for an already processed module is refused.
    pub fn on_module_loaded(
        &mut self,
        image: &mut ModuleImage<'_>,
        host: &mut HostServices<'_>,
    ) -> Result<Option<BatchReport>> {
        let id = image.id().to_string();
        let Some(batch) = self.batches.get(&id) else {
            debug!("No batch registered for {}", id);
            return Ok(None);
        };
        if self.resolved.contains_key(&id) {
            return Err(Error::ModuleAlreadyProcessed(id));
        }

        info!("Processing {} (base {:#x}, size {:#x})", id, image.base(), image.size());
        let table = self.resolved.entry(id).or_default();
        batch.run(image, host, table).map(Some)
    }
}
