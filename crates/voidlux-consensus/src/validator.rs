//! Per-node proposal validation seam.

use voidlux_core::Proposal;

/// Domain-specific proposal vetting, consulted before every vote.
///
/// Returning `Err(reason)` produces a NO vote carrying the reason; it
/// is an outcome, not an error.
pub trait ProposalValidator: Send + Sync + 'static {
    /// Vets a proposal this node has been asked to vote on.
    fn validate(&self, proposal: &Proposal) -> Result<(), String>;
}

/// The default validator: every well-formed proposal passes.
pub struct AcceptAll;

impl ProposalValidator for AcceptAll {
    fn validate(&self, _proposal: &Proposal) -> Result<(), String> {
        Ok(())
    }
}
