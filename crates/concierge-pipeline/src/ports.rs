//! Seams to external collaborators.
//!
//! The pipeline only ever talks to these traits; the host wires them to
//! the real clinic directory, the egress queue, and any external
//! orchestrator.

use async_trait::async_trait;

use concierge_narrowing::Doctor;

use crate::context::{ClinicProfile, FaqEntry, Lane, ServiceInfo};

/// Read access to clinic master data.
#[async_trait]
pub trait ClinicDirectory: Send + Sync {
    /// Map an organization id to its clinic id. Returns the input when it
    /// already is a clinic id.
    async fn resolve_clinic_id(&self, organization_id: &str) -> Option<String>;

    async fn clinic_profile(&self, clinic_id: &str) -> Option<ClinicProfile>;

    async fn services(&self, clinic_id: &str) -> Vec<ServiceInfo>;

    async fn doctors(&self, clinic_id: &str) -> Vec<Doctor>;

    /// Doctors eligible to perform the named service, the FULL set (no
    /// server-side limit — the caller slices for display). `None` means the
    /// lookup failed, which is distinct from an empty list.
    async fn eligible_doctors(&self, clinic_id: &str, service_name: &str) -> Option<Vec<Doctor>>;

    async fn faqs(&self, clinic_id: &str) -> Vec<FaqEntry>;

    /// Patient display fields: (patient_id, first_name, last_name, language).
    async fn patient_profile(
        &self,
        clinic_id: &str,
        phone: &str,
    ) -> Option<(String, Option<String>, Option<String>, Option<String>)>;
}

/// Outbound reply sink — the egress queue, keyed by tenant instance.
#[async_trait]
pub trait ReplyQueue: Send + Sync {
    async fn enqueue_reply(
        &self,
        instance: &str,
        to: &str,
        text: &str,
        metadata: serde_json::Value,
    ) -> Result<(), String>;
}

/// The Redis-streams egress queue as a [`ReplyQueue`].
pub struct EgressReplyQueue(pub concierge_egress::EgressQueue);

#[async_trait]
impl ReplyQueue for EgressReplyQueue {
    async fn enqueue_reply(
        &self,
        instance: &str,
        to: &str,
        text: &str,
        metadata: serde_json::Value,
    ) -> Result<(), String> {
        self.0
            .enqueue(
                &concierge_core::types::InstanceName::new(instance),
                to,
                text,
                None,
                Some(metadata),
            )
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Optional external turn orchestrator (feature-flagged per clinic/lane).
#[async_trait]
pub trait TurnDelegate: Send + Sync {
    /// Whether this clinic+lane combination is delegated.
    fn handles(&self, clinic_id: &str, lane: Lane) -> bool;

    /// Run the turn externally. `Ok(None)`/`Err` fall through to the LLM
    /// step; `Ok(Some(reply))` ends the pipeline.
    async fn run_turn(
        &self,
        clinic_id: &str,
        session_id: &str,
        message: &str,
    ) -> Result<Option<String>, String>;
}
