//! Shared fakes for step tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use concierge_narrowing::Doctor;

use crate::context::{ClinicProfile, FaqEntry, ServiceInfo};
use crate::ports::{ClinicDirectory, ReplyQueue};

/// Directory with a single clinic and configurable doctors/services.
pub struct FakeDirectory {
    pub profile: ClinicProfile,
    pub services: Vec<ServiceInfo>,
    pub doctors: Vec<Doctor>,
    pub faqs: Vec<FaqEntry>,
    /// None = lookup failure; Some(list) = eligible set.
    pub eligible: Option<Vec<Doctor>>,
    pub patient: Option<(String, Option<String>, Option<String>, Option<String>)>,
}

impl Default for FakeDirectory {
    fn default() -> Self {
        Self {
            profile: ClinicProfile {
                name: "Shoreline Dental".to_string(),
                location: "Haifa, IL".to_string(),
                timezone: "UTC".to_string(),
                instance_name: Some("inst-a".to_string()),
                weekday_hours: "9:00-18:00".to_string(),
                saturday_hours: "closed".to_string(),
                sunday_hours: "9:00-14:00".to_string(),
            },
            services: vec![ServiceInfo {
                id: "svc-1".to_string(),
                name: "cleaning".to_string(),
                price: Some(80.0),
                duration_minutes: Some(45),
            }],
            doctors: vec![Doctor {
                doctor_id: "d1".to_string(),
                doctor_name: "Dr. Li".to_string(),
            }],
            faqs: vec![],
            eligible: Some(vec![Doctor {
                doctor_id: "d1".to_string(),
                doctor_name: "Dr. Li".to_string(),
            }]),
            patient: None,
        }
    }
}

#[async_trait]
impl ClinicDirectory for FakeDirectory {
    async fn resolve_clinic_id(&self, organization_id: &str) -> Option<String> {
        Some(organization_id.to_string())
    }

    async fn clinic_profile(&self, _clinic_id: &str) -> Option<ClinicProfile> {
        Some(self.profile.clone())
    }

    async fn services(&self, _clinic_id: &str) -> Vec<ServiceInfo> {
        self.services.clone()
    }

    async fn doctors(&self, _clinic_id: &str) -> Vec<Doctor> {
        self.doctors.clone()
    }

    async fn eligible_doctors(&self, _clinic_id: &str, _service: &str) -> Option<Vec<Doctor>> {
        self.eligible.clone()
    }

    async fn faqs(&self, _clinic_id: &str) -> Vec<FaqEntry> {
        self.faqs.clone()
    }

    async fn patient_profile(
        &self,
        _clinic_id: &str,
        _phone: &str,
    ) -> Option<(String, Option<String>, Option<String>, Option<String>)> {
        self.patient.clone()
    }
}

/// Directory that knows nothing.
pub struct EmptyDirectory;

#[async_trait]
impl ClinicDirectory for EmptyDirectory {
    async fn resolve_clinic_id(&self, organization_id: &str) -> Option<String> {
        Some(organization_id.to_string())
    }
    async fn clinic_profile(&self, _clinic_id: &str) -> Option<ClinicProfile> {
        None
    }
    async fn services(&self, _clinic_id: &str) -> Vec<ServiceInfo> {
        Vec::new()
    }
    async fn doctors(&self, _clinic_id: &str) -> Vec<Doctor> {
        Vec::new()
    }
    async fn eligible_doctors(&self, _clinic_id: &str, _service: &str) -> Option<Vec<Doctor>> {
        None
    }
    async fn faqs(&self, _clinic_id: &str) -> Vec<FaqEntry> {
        Vec::new()
    }
    async fn patient_profile(
        &self,
        _clinic_id: &str,
        _phone: &str,
    ) -> Option<(String, Option<String>, Option<String>, Option<String>)> {
        None
    }
}

/// Records every enqueued reply.
#[derive(Default)]
pub struct RecordingQueue {
    pub sent: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl ReplyQueue for RecordingQueue {
    async fn enqueue_reply(
        &self,
        instance: &str,
        to: &str,
        text: &str,
        _metadata: serde_json::Value,
    ) -> Result<(), String> {
        self.sent
            .lock()
            .await
            .push((instance.to_string(), to.to_string(), text.to_string()));
        Ok(())
    }
}

pub fn store() -> Arc<dyn concierge_store::ConversationStore> {
    Arc::new(concierge_store::SqliteStore::in_memory().expect("open store"))
}

/// Provider that always answers with one fixed line.
pub struct FixedProvider(pub &'static str);

#[async_trait]
impl crate::provider::LlmProvider for FixedProvider {
    async fn generate(
        &self,
        _request: &crate::provider::LlmRequest,
    ) -> Result<crate::provider::LlmResponse, String> {
        Ok(crate::provider::LlmResponse {
            content: self.0.to_string(),
            provider: "test".to_string(),
            model: "test-1".to_string(),
            tokens_in: 20,
            tokens_out: 10,
            ..Default::default()
        })
    }
}
