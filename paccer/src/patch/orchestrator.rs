use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    dex::{self, DecodeError, DexFile, EncodeError},
    types::{any_patched, EmptyListForm, PatchOutcome, PatchRequest, PatchStatus},
};

use super::{locator, rewriter::BodyRewriter};

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to decode dex: {0}")]
    Decode(#[from] DecodeError),
    #[error("failed to encode dex: {0}")]
    Encode(#[from] EncodeError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PatchOptions {
    pub empty_list_form: EmptyListForm,
}

/// Result of one run over a container
#[derive(Debug, Clone)]
pub struct PatchRun {
    /// Present only when at least one request was patched
    pub output: Option<Vec<u8>>,
    pub outcomes: Vec<PatchOutcome>,
}

impl PatchRun {
    pub fn any_patched(&self) -> bool {
        any_patched(&self.outcomes)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Patcher {
    rewriter: BodyRewriter,
}

impl Patcher {
    pub fn new(options: PatchOptions) -> Self {
        Patcher {
            rewriter: BodyRewriter::new(options.empty_list_form),
        }
    }

    /// Decodes `input`, applies `requests` in order and re-encodes if
    /// anything was patched. `report` sees each outcome as soon as it is
    /// known.
    pub fn run(
        &self,
        input: &[u8],
        requests: &[PatchRequest],
        report: impl FnMut(&PatchOutcome),
    ) -> Result<PatchRun, PatchError> {
        let mut dex = dex::decode(input)?;
        let outcomes = self.apply(&mut dex, requests, report);

        let output = if any_patched(&outcomes) {
            let bytes = dex::encode(&dex)?;
            info!("re-encoded dex, {} bytes", bytes.len());
            Some(bytes)
        } else {
            debug!("nothing patched, no output");
            None
        };
        Ok(PatchRun { output, outcomes })
    }

    /// Applies `requests` to an already decoded container
    pub fn apply(
        &self,
        dex: &mut DexFile,
        requests: &[PatchRequest],
        mut report: impl FnMut(&PatchOutcome),
    ) -> Vec<PatchOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let status = self.apply_one(dex, request);
            let outcome = PatchOutcome {
                method_name: request.method_name.clone(),
                status,
            };
            report(&outcome);
            outcomes.push(outcome);
        }
        outcomes
    }

    fn apply_one(&self, dex: &mut DexFile, request: &PatchRequest) -> PatchStatus {
        let Some(record) = locator::find(dex, request) else {
            debug!("no candidate for {}", request.method_name);
            return PatchStatus::NotFound;
        };
        let key = record.key;
        let signature = record.signature();

        match self.rewriter.rewrite(dex, key, request.behavior) {
            Ok(()) => {
                info!("patched {} as {}", signature, request.behavior);
                PatchStatus::Patched(signature)
            }
            Err(err) => {
                warn!("failed to patch {}: {}", signature, err);
                PatchStatus::AssemblyFailed(err.to_string())
            }
        }
    }
}
