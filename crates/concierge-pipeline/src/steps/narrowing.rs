use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use concierge_core::types::ClinicId;
use concierge_narrowing::{Doctor, DoctorDirectory, NarrowingService};

use crate::context::PipelineContext;
use crate::ports::ClinicDirectory;
use crate::step::{PipelineStep, StepError};

/// Bridges the clinic directory into the narrowing service's lookup seam.
struct DirectoryAdapter {
    directory: Arc<dyn ClinicDirectory>,
}

#[async_trait]
impl DoctorDirectory for DirectoryAdapter {
    async fn eligible_doctors(
        &self,
        clinic_id: &ClinicId,
        service_name: &str,
        excluded_doctor_ids: &BTreeSet<String>,
    ) -> (Option<u32>, Vec<Doctor>) {
        match self
            .directory
            .eligible_doctors(clinic_id.as_str(), service_name)
            .await
        {
            // Full set, filtered by exclusions, counted AFTER filtering.
            Some(doctors) => {
                let doctors: Vec<Doctor> = doctors
                    .into_iter()
                    .filter(|d| {
                        !excluded_doctor_ids.contains(&d.doctor_id)
                            && !excluded_doctor_ids
                                .iter()
                                .any(|e| e.eq_ignore_ascii_case(&d.doctor_name))
                    })
                    .collect();
                (Some(doctors.len() as u32), doctors)
            }
            // Lookup failed — None, which downstream treats differently
            // from zero.
            None => (None, Vec::new()),
        }
    }
}

/// Compute the narrowing instruction before the LLM runs.
///
/// Reads constraints from the context — the constraint step already
/// hydrated them — never from the store, to avoid desync.
pub struct NarrowingStep {
    service: NarrowingService<DirectoryAdapter>,
    clinic_strategy: String,
}

impl NarrowingStep {
    pub fn new(directory: Arc<dyn ClinicDirectory>, clinic_strategy: &str) -> Self {
        Self {
            service: NarrowingService::new(DirectoryAdapter { directory }),
            clinic_strategy: clinic_strategy.to_string(),
        }
    }
}

#[async_trait]
impl PipelineStep for NarrowingStep {
    fn name(&self) -> &'static str {
        "narrowing"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<bool, StepError> {
        let constraints = match ctx.constraints {
            Some(ref c) => c.clone(),
            None => {
                warn!("no constraints in context, using empty set");
                Default::default()
            }
        };

        let clinic_id = ClinicId::new(ctx.effective_clinic_id());
        let instruction = self
            .service
            .decide(&constraints, &clinic_id, &ctx.message, &self.clinic_strategy)
            .await;

        info!(
            case = instruction.case.as_str(),
            action = ?instruction.action,
            doctor_count = ?instruction.eligible_doctor_count,
            "narrowing decision"
        );
        ctx.narrowing_instruction = Some(instruction);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::FakeDirectory;
    use concierge_narrowing::{NarrowingAction, NarrowingCase, QuestionType};

    #[tokio::test]
    async fn service_with_one_doctor_asks_time_with_doctor() {
        let step = NarrowingStep::new(Arc::new(FakeDirectory::default()), "service_first");
        let mut ctx = PipelineContext::new("I'd like a cleaning", "1555", "c1", "whatsapp");
        let mut constraints = concierge_constraints::ConversationConstraints::default();
        constraints.set_desired_service("cleaning");
        ctx.constraints = Some(constraints);

        assert!(step.execute(&mut ctx).await.unwrap());
        let instruction = ctx.narrowing_instruction.unwrap();
        assert_eq!(instruction.action, NarrowingAction::AskQuestion);
        assert_eq!(instruction.case, NarrowingCase::ServiceOnly);
        assert_eq!(instruction.question_type, Some(QuestionType::AskTimeWithDoctor));
        assert_eq!(instruction.eligible_doctor_count, Some(1));
        assert_eq!(
            instruction.question_args.get("doctor_name"),
            Some(&serde_json::Value::from("Dr. Li"))
        );
    }

    #[tokio::test]
    async fn lookup_failure_propagates_as_none() {
        let directory = FakeDirectory {
            eligible: None,
            ..Default::default()
        };
        let step = NarrowingStep::new(Arc::new(directory), "service_first");
        let mut ctx = PipelineContext::new("cleaning please", "1555", "c1", "whatsapp");
        let mut constraints = concierge_constraints::ConversationConstraints::default();
        constraints.set_desired_service("cleaning");
        ctx.constraints = Some(constraints);

        assert!(step.execute(&mut ctx).await.unwrap());
        let instruction = ctx.narrowing_instruction.unwrap();
        assert_eq!(instruction.eligible_doctor_count, None);
        assert_eq!(instruction.question_type, Some(QuestionType::AskForTime));
    }

    #[tokio::test]
    async fn excluded_doctor_names_reduce_the_count() {
        let step = NarrowingStep::new(Arc::new(FakeDirectory::default()), "service_first");
        let mut ctx = PipelineContext::new("cleaning, not Dr. Li", "1555", "c1", "whatsapp");
        let mut constraints = concierge_constraints::ConversationConstraints::default();
        constraints.set_desired_service("cleaning");
        constraints.excluded_doctors.insert("Dr. Li".to_string());
        ctx.constraints = Some(constraints);

        assert!(step.execute(&mut ctx).await.unwrap());
        let instruction = ctx.narrowing_instruction.unwrap();
        assert_eq!(instruction.eligible_doctor_count, Some(0));
        assert_eq!(instruction.question_type, Some(QuestionType::SuggestConsultation));
    }
}
