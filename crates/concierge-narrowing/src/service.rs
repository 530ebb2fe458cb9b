use std::collections::BTreeSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tracing::{info, instrument, warn};

use concierge_constraints::ConversationConstraints;
use concierge_core::types::ClinicId;

use crate::types::{
    Doctor, NarrowingCase, NarrowingInstruction, QuestionType, ToolCallPlan, UrgencyLevel,
};

/// Doctors shown to the user when offering a choice; the count always uses
/// the full result set.
const DISPLAY_LIMIT: usize = 5;

// Urgency phrase patterns (case-insensitive), multilingual.
static URGENT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        // English
        r"\basap\b",
        r"\burgent\b",
        r"\bemergency\b",
        r"\bhurts?\b",
        r"\bpain\b",
        r"\bimmediately\b",
        r"\bright away\b",
        r"\bstat\b",
        // Spanish
        r"\bhoy\b",
        r"\bahora\b",
        r"\bdolor\b",
        r"\bduele\b",
        r"\burgente\b",
        r"\bemergencia\b",
        // Russian
        r"\bсрочно\b",
        r"\bнемедленно\b",
        r"\bболит\b",
        r"\bболь\b",
    ])
});

static SOON_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\bthis week\b",
        r"\besta semana\b",
        r"\bэту неделю\b",
        r"\bsoon\b",
        r"\bpronto\b",
        r"\bскоро\b",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).expect("static pattern"))
        .collect()
}

/// Eligible-doctor lookup seam.
///
/// Implementations MUST return the full set — no server-side LIMIT — so the
/// count classification below is correct; the service slices for display.
/// `None` for the count means the lookup itself failed, never "zero doctors".
#[async_trait]
pub trait DoctorDirectory: Send + Sync {
    async fn eligible_doctors(
        &self,
        clinic_id: &ClinicId,
        service_name: &str,
        excluded_doctor_ids: &BTreeSet<String>,
    ) -> (Option<u32>, Vec<Doctor>);
}

/// Transforms constraints into a [`NarrowingInstruction`].
///
/// This is the decision engine that keeps agent behavior deterministic.
pub struct NarrowingService<D> {
    directory: D,
}

impl<D: DoctorDirectory> NarrowingService<D> {
    pub fn new(directory: D) -> Self {
        Self { directory }
    }

    /// Detect urgency level from user message text.
    pub fn classify_urgency(&self, user_message: &str) -> UrgencyLevel {
        if user_message.is_empty() {
            return UrgencyLevel::Routine;
        }
        if URGENT_PATTERNS.iter().any(|re| re.is_match(user_message)) {
            return UrgencyLevel::Urgent;
        }
        if SOON_PATTERNS.iter().any(|re| re.is_match(user_message)) {
            return UrgencyLevel::Soon;
        }
        UrgencyLevel::Routine
    }

    /// Map (has_service, has_doctor, has_time) to the canonical case.
    pub fn classify_case(&self, constraints: &ConversationConstraints) -> NarrowingCase {
        match (
            constraints.has_service(),
            constraints.has_doctor(),
            constraints.has_time(),
        ) {
            (true, true, true) => NarrowingCase::FullySpecified,
            (true, false, true) => NarrowingCase::ServiceAndTime,
            (true, true, false) => NarrowingCase::ServiceAndDoctor,
            (true, false, false) => NarrowingCase::ServiceOnly,
            (false, true, _) => NarrowingCase::DoctorOnly,
            (false, false, true) => NarrowingCase::TimeOnly,
            (false, false, false) => NarrowingCase::NothingKnown,
        }
    }

    /// Main decision method: what should the agent do next?
    #[instrument(skip(self, constraints, user_message), fields(clinic = %clinic_id.short()))]
    pub async fn decide(
        &self,
        constraints: &ConversationConstraints,
        clinic_id: &ClinicId,
        user_message: &str,
        clinic_strategy: &str,
    ) -> NarrowingInstruction {
        let mut case = self.classify_case(constraints);
        let urgency = self.classify_urgency(user_message);

        info!(case = case.as_str(), ?urgency, "narrowing decision");

        // Urgency override: urgent with nothing known narrows to today/tomorrow.
        if urgency == UrgencyLevel::Urgent && case == NarrowingCase::NothingKnown {
            case = NarrowingCase::UrgentNoTime;
        }

        // doctor_count is None on lookup failure, Some(0) if genuinely none.
        let (doctor_count, doctors) = match constraints.desired_service.as_deref() {
            Some(service) => {
                self.directory
                    .eligible_doctors(clinic_id, service, &constraints.excluded_doctors)
                    .await
            }
            None => (None, Vec::new()),
        };

        build_instruction(
            case,
            constraints,
            urgency,
            &doctors[..doctors.len().min(DISPLAY_LIMIT)],
            doctor_count,
            clinic_strategy,
        )
    }
}

/// Build the instruction for a classified case. Pure — the whole decision
/// table lives here so tests can drive it without a directory.
pub fn build_instruction(
    case: NarrowingCase,
    constraints: &ConversationConstraints,
    urgency: UrgencyLevel,
    doctors: &[Doctor],
    doctor_count: Option<u32>,
    clinic_strategy: &str,
) -> NarrowingInstruction {
    let service = constraints.desired_service.clone().unwrap_or_default();

    match case {
        NarrowingCase::FullySpecified => NarrowingInstruction::call(
            case,
            ToolCallPlan::check_availability(json!({
                "service_name": constraints.desired_service,
                "doctor_id": constraints.desired_doctor_id,
                "preferred_date": constraints.time_window_start,
                "flexibility_days": 1,
            })),
            urgency,
        )
        .with_doctor_count(doctor_count),

        NarrowingCase::ServiceAndTime => {
            let flex_days = if urgency == UrgencyLevel::Urgent { 1 } else { 2 };
            NarrowingInstruction::call(
                case,
                ToolCallPlan::check_availability(json!({
                    "service_name": constraints.desired_service,
                    "preferred_date": constraints.time_window_start,
                    "flexibility_days": flex_days,
                })),
                urgency,
            )
            .with_doctor_count(doctor_count)
        }

        NarrowingCase::ServiceAndDoctor => {
            NarrowingInstruction::ask(case, QuestionType::AskTimeWithService, urgency)
                .with_arg("service_name", service.as_str())
                .with_arg(
                    "doctor_name",
                    constraints.desired_doctor.clone().unwrap_or_default(),
                )
                .with_context("Have service+doctor. Need time.")
                .with_doctor_count(doctor_count)
        }

        NarrowingCase::ServiceOnly => match doctor_count {
            // Lookup failed: ask time, let the tool resolve doctor choice.
            None => {
                warn!("doctor lookup unavailable, falling back to time question");
                NarrowingInstruction::ask(case, QuestionType::AskForTime, urgency)
                    .with_arg("service_name", service.as_str())
                    .with_context("Lookup failed - couldn't check doctors. Ask time, let tool handle selection.")
            }
            // Genuinely no doctors for this service.
            Some(0) => NarrowingInstruction::ask(case, QuestionType::SuggestConsultation, urgency)
                .with_arg("service_name", service.as_str())
                .with_context("No eligible doctors. Suggest consultation.")
                .with_doctor_count(Some(0)),
            Some(1) => {
                let doc_name = doctors
                    .first()
                    .map(|d| d.doctor_name.clone())
                    .unwrap_or_else(|| "the doctor".to_string());
                NarrowingInstruction::ask(case, QuestionType::AskTimeWithDoctor, urgency)
                    .with_arg("doctor_name", doc_name.as_str())
                    .with_arg("service_name", service.as_str())
                    .with_context(&format!("1 doctor: {doc_name}. Ask time."))
                    .with_doctor_count(Some(1))
            }
            // 2-3 doctors: offer the list.
            Some(n) if n <= 3 => {
                let names: Vec<serde_json::Value> = doctors
                    .iter()
                    .map(|d| serde_json::Value::from(d.doctor_name.clone()))
                    .collect();
                NarrowingInstruction::ask(case, QuestionType::AskFirstAvailable, urgency)
                    .with_arg("doctor_names", names)
                    .with_arg("service_name", service.as_str())
                    .with_context("2-3 doctors. Ask preference or first available.")
                    .with_doctor_count(Some(n))
            }
            // Many doctors: narrow by time first.
            Some(n) => NarrowingInstruction::ask(case, QuestionType::AskForTime, urgency)
                .with_arg("service_name", service.as_str())
                .with_context("Many doctors. Ask time to narrow.")
                .with_doctor_count(Some(n)),
        },

        NarrowingCase::DoctorOnly => {
            let doctor = constraints.desired_doctor.clone().unwrap_or_default();
            if clinic_strategy == "doctor_first" {
                NarrowingInstruction::ask(case, QuestionType::AskTimeWithDoctor, urgency)
                    .with_arg("doctor_name", doctor.as_str())
                    .with_context("Doctor first. Assume consult, ask time.")
                    .with_doctor_count(doctor_count)
            } else {
                NarrowingInstruction::ask(case, QuestionType::AskForService, urgency)
                    .with_arg("doctor_name", doctor.as_str())
                    .with_context("Doctor known. Ask service.")
                    .with_doctor_count(doctor_count)
            }
        }

        NarrowingCase::TimeOnly => {
            NarrowingInstruction::ask(case, QuestionType::AskForService, urgency)
                .with_context("Time known. Need service.")
        }

        NarrowingCase::UrgentNoTime => {
            NarrowingInstruction::ask(case, QuestionType::AskTodayOrTomorrow, urgency)
                .with_context("Urgent. Narrow to today/tomorrow.")
        }

        NarrowingCase::NothingKnown => {
            NarrowingInstruction::ask(case, QuestionType::AskForService, urgency)
                .with_context("Start with service (service-first strategy).")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NarrowingAction;
    use std::collections::BTreeSet;

    struct FixedDirectory {
        count: Option<u32>,
        doctors: Vec<Doctor>,
    }

    #[async_trait]
    impl DoctorDirectory for FixedDirectory {
        async fn eligible_doctors(
            &self,
            _clinic_id: &ClinicId,
            _service_name: &str,
            excluded: &BTreeSet<String>,
        ) -> (Option<u32>, Vec<Doctor>) {
            let doctors: Vec<Doctor> = self
                .doctors
                .iter()
                .filter(|d| !excluded.contains(&d.doctor_id))
                .cloned()
                .collect();
            match self.count {
                None => (None, Vec::new()),
                Some(_) => (Some(doctors.len() as u32), doctors),
            }
        }
    }

    fn doc(id: &str, name: &str) -> Doctor {
        Doctor {
            doctor_id: id.to_string(),
            doctor_name: name.to_string(),
        }
    }

    fn with_service(name: &str) -> ConversationConstraints {
        let mut c = ConversationConstraints::default();
        c.set_desired_service(name);
        c
    }

    fn svc<D: DoctorDirectory>(directory: D) -> NarrowingService<D> {
        NarrowingService::new(directory)
    }

    #[tokio::test]
    async fn single_eligible_doctor_asks_time_with_doctor() {
        let service = svc(FixedDirectory {
            count: Some(1),
            doctors: vec![doc("d1", "Dr. Li")],
        });
        let instruction = service
            .decide(
                &with_service("cleaning"),
                &ClinicId::new("c1"),
                "I'd like a cleaning",
                "service_first",
            )
            .await;

        assert_eq!(instruction.action, NarrowingAction::AskQuestion);
        assert_eq!(instruction.case, NarrowingCase::ServiceOnly);
        assert_eq!(instruction.question_type, Some(QuestionType::AskTimeWithDoctor));
        assert_eq!(instruction.eligible_doctor_count, Some(1));
        assert_eq!(
            instruction.question_args.get("doctor_name"),
            Some(&serde_json::Value::from("Dr. Li"))
        );
        assert_eq!(
            instruction.question_args.get("service_name"),
            Some(&serde_json::Value::from("cleaning"))
        );
    }

    #[tokio::test]
    async fn lookup_failure_is_not_zero() {
        let service = svc(FixedDirectory {
            count: None,
            doctors: vec![],
        });
        let instruction = service
            .decide(&with_service("cleaning"), &ClinicId::new("c1"), "", "service_first")
            .await;

        // None means the lookup failed — must ask for time, not suggest a consultation.
        assert_eq!(instruction.eligible_doctor_count, None);
        assert_eq!(instruction.question_type, Some(QuestionType::AskForTime));
    }

    #[tokio::test]
    async fn zero_doctors_suggests_consultation() {
        let service = svc(FixedDirectory {
            count: Some(0),
            doctors: vec![],
        });
        let instruction = service
            .decide(&with_service("implants"), &ClinicId::new("c1"), "", "service_first")
            .await;

        assert_eq!(instruction.eligible_doctor_count, Some(0));
        assert_eq!(instruction.question_type, Some(QuestionType::SuggestConsultation));
    }

    #[tokio::test]
    async fn two_doctors_offer_first_available() {
        let service = svc(FixedDirectory {
            count: Some(2),
            doctors: vec![doc("d1", "Dr. Li"), doc("d2", "Dr. Ruiz")],
        });
        let instruction = service
            .decide(&with_service("cleaning"), &ClinicId::new("c1"), "", "service_first")
            .await;

        assert_eq!(instruction.question_type, Some(QuestionType::AskFirstAvailable));
        assert_eq!(instruction.eligible_doctor_count, Some(2));
    }

    #[tokio::test]
    async fn many_doctors_narrow_by_time() {
        let service = svc(FixedDirectory {
            count: Some(4),
            doctors: vec![
                doc("d1", "A"),
                doc("d2", "B"),
                doc("d3", "C"),
                doc("d4", "D"),
            ],
        });
        let instruction = service
            .decide(&with_service("cleaning"), &ClinicId::new("c1"), "", "service_first")
            .await;

        assert_eq!(instruction.question_type, Some(QuestionType::AskForTime));
        assert_eq!(instruction.eligible_doctor_count, Some(4));
    }

    #[tokio::test]
    async fn excluded_doctors_are_filtered_before_counting() {
        let service = svc(FixedDirectory {
            count: Some(2),
            doctors: vec![doc("d1", "Dr. Li"), doc("d2", "Dr. Ruiz")],
        });
        let mut constraints = with_service("cleaning");
        constraints.excluded_doctors.insert("d2".to_string());

        let instruction = service
            .decide(&constraints, &ClinicId::new("c1"), "", "service_first")
            .await;

        assert_eq!(instruction.eligible_doctor_count, Some(1));
        assert_eq!(instruction.question_type, Some(QuestionType::AskTimeWithDoctor));
    }

    #[tokio::test]
    async fn fully_specified_calls_availability() {
        let service = svc(FixedDirectory {
            count: Some(1),
            doctors: vec![doc("d1", "Dr. Li")],
        });
        let mut constraints = with_service("cleaning");
        constraints.desired_doctor = Some("Dr. Li".to_string());
        constraints.desired_doctor_id = Some("d1".to_string());
        constraints.set_time_window("2026-08-06T08:00:00", "2026-08-06T12:00:00", "tomorrow");

        let instruction = service
            .decide(&constraints, &ClinicId::new("c1"), "", "service_first")
            .await;

        assert_eq!(instruction.action, NarrowingAction::CallTool);
        let plan = instruction.tool_call.expect("tool plan");
        assert_eq!(plan.tool_name, "check_availability");
        assert_eq!(plan.params["flexibility_days"], 1);
    }

    #[tokio::test]
    async fn urgent_service_and_time_tightens_flexibility() {
        let service = svc(FixedDirectory {
            count: Some(2),
            doctors: vec![doc("d1", "A"), doc("d2", "B")],
        });
        let mut constraints = with_service("cleaning");
        constraints.set_time_window("2026-08-06T08:00:00", "2026-08-06T12:00:00", "tomorrow");

        let routine = service
            .decide(&constraints, &ClinicId::new("c1"), "whenever works", "service_first")
            .await;
        assert_eq!(routine.tool_call.as_ref().unwrap().params["flexibility_days"], 2);

        let urgent = service
            .decide(&constraints, &ClinicId::new("c1"), "it hurts, ASAP", "service_first")
            .await;
        assert_eq!(urgent.tool_call.as_ref().unwrap().params["flexibility_days"], 1);
    }

    #[tokio::test]
    async fn urgent_nothing_known_becomes_today_or_tomorrow() {
        let service = svc(FixedDirectory {
            count: None,
            doctors: vec![],
        });
        let instruction = service
            .decide(
                &ConversationConstraints::default(),
                &ClinicId::new("c1"),
                "emergency, my tooth hurts",
                "service_first",
            )
            .await;

        assert_eq!(instruction.case, NarrowingCase::UrgentNoTime);
        assert_eq!(instruction.question_type, Some(QuestionType::AskTodayOrTomorrow));
        assert_eq!(instruction.urgency, UrgencyLevel::Urgent);
    }

    #[tokio::test]
    async fn doctor_only_follows_clinic_strategy() {
        let service = svc(FixedDirectory {
            count: None,
            doctors: vec![],
        });
        let mut constraints = ConversationConstraints::default();
        constraints.set_desired_doctor("Dr. Li");

        let service_first = service
            .decide(&constraints, &ClinicId::new("c1"), "", "service_first")
            .await;
        assert_eq!(service_first.question_type, Some(QuestionType::AskForService));

        let doctor_first = service
            .decide(&constraints, &ClinicId::new("c1"), "", "doctor_first")
            .await;
        assert_eq!(doctor_first.question_type, Some(QuestionType::AskTimeWithDoctor));
    }

    #[test]
    fn urgency_patterns_multilingual() {
        let service = svc(FixedDirectory {
            count: None,
            doctors: vec![],
        });
        assert_eq!(service.classify_urgency("у меня болит зуб"), UrgencyLevel::Urgent);
        assert_eq!(service.classify_urgency("esta semana por favor"), UrgencyLevel::Soon);
        assert_eq!(service.classify_urgency("sometime next month"), UrgencyLevel::Routine);
    }

    #[test]
    fn case_classification_covers_all_combinations() {
        let service = svc(FixedDirectory {
            count: None,
            doctors: vec![],
        });
        let mut c = ConversationConstraints::default();
        assert_eq!(service.classify_case(&c), NarrowingCase::NothingKnown);

        c.set_desired_service("cleaning");
        assert_eq!(service.classify_case(&c), NarrowingCase::ServiceOnly);

        c.set_time_window("a", "b", "l");
        assert_eq!(service.classify_case(&c), NarrowingCase::ServiceAndTime);

        c.set_desired_doctor("Dr. Li");
        assert_eq!(service.classify_case(&c), NarrowingCase::FullySpecified);

        let mut d = ConversationConstraints::default();
        d.set_desired_doctor("Dr. Li");
        assert_eq!(service.classify_case(&d), NarrowingCase::DoctorOnly);

        let mut t = ConversationConstraints::default();
        t.set_time_window("a", "b", "l");
        assert_eq!(service.classify_case(&t), NarrowingCase::TimeOnly);
    }
}
