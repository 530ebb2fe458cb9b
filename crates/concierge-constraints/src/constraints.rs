use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Mutable per-session constraints.
///
/// Invariant: a desired service/doctor is never simultaneously excluded.
/// Mutations go through the methods below, which keep the two sides
/// consistent; a "switch" atomically moves the old desire into the
/// exclusion set before installing the new one.
///
/// `BTreeSet` keeps exclusion listings deterministic for prompts and logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationConstraints {
    #[serde(default)]
    pub excluded_doctors: BTreeSet<String>,
    #[serde(default)]
    pub excluded_services: BTreeSet<String>,

    pub desired_service: Option<String>,
    pub desired_service_id: Option<String>,
    pub desired_doctor: Option<String>,
    pub desired_doctor_id: Option<String>,

    /// ISO timestamps in the clinic timezone.
    pub time_window_start: Option<String>,
    pub time_window_end: Option<String>,
    /// Human-readable window label, e.g. "tomorrow morning".
    pub time_window_label: Option<String>,
}

impl ConversationConstraints {
    pub fn is_empty(&self) -> bool {
        self.excluded_doctors.is_empty()
            && self.excluded_services.is_empty()
            && self.desired_service.is_none()
            && self.desired_doctor.is_none()
            && self.time_window_start.is_none()
            && self.time_window_end.is_none()
    }

    pub fn has_service(&self) -> bool {
        self.desired_service.is_some() || self.desired_service_id.is_some()
    }

    pub fn has_doctor(&self) -> bool {
        self.desired_doctor.is_some() || self.desired_doctor_id.is_some()
    }

    pub fn has_time(&self) -> bool {
        self.time_window_start.is_some() || self.time_window_end.is_some()
    }

    /// Exclude an entity from both doctors and services. If it was the
    /// current desire, the desire is dropped.
    pub fn exclude(&mut self, entity: &str) {
        let entity = entity.trim();
        if entity.is_empty() {
            return;
        }
        self.excluded_doctors.insert(entity.to_string());
        self.excluded_services.insert(entity.to_string());
        if matches_ci(self.desired_doctor.as_deref(), entity) {
            self.desired_doctor = None;
            self.desired_doctor_id = None;
        }
        if matches_ci(self.desired_service.as_deref(), entity) {
            self.desired_service = None;
            self.desired_service_id = None;
        }
    }

    /// Set the desired service, lifting it out of the exclusion set if an
    /// earlier "forget" put it there.
    pub fn set_desired_service(&mut self, service: &str) {
        let service = service.trim();
        if service.is_empty() {
            return;
        }
        self.excluded_services.retain(|s| !s.eq_ignore_ascii_case(service));
        self.desired_service = Some(service.to_string());
    }

    /// Set the desired doctor, lifting it out of the exclusion set.
    pub fn set_desired_doctor(&mut self, doctor: &str) {
        let doctor = doctor.trim();
        if doctor.is_empty() {
            return;
        }
        self.excluded_doctors.retain(|d| !d.eq_ignore_ascii_case(doctor));
        self.desired_doctor = Some(doctor.to_string());
    }

    /// Atomic switch: the old desire is excluded, the new one installed.
    /// Ordering matters — excluding first means the new desire cannot be
    /// re-excluded by the same action.
    pub fn switch_service(&mut self, exclude: &str, desire: &str) {
        self.exclude(exclude);
        self.set_desired_service(desire);
    }

    pub fn set_time_window(&mut self, start: &str, end: &str, label: &str) {
        self.time_window_start = Some(start.to_string());
        self.time_window_end = Some(end.to_string());
        self.time_window_label = Some(label.to_string());
    }

    /// Meta-reset: drop everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Debug-only check of the desired-vs-excluded invariant.
    pub fn invariant_holds(&self) -> bool {
        let service_ok = self
            .desired_service
            .as_deref()
            .map(|s| !self.excluded_services.iter().any(|e| e.eq_ignore_ascii_case(s)))
            .unwrap_or(true);
        let doctor_ok = self
            .desired_doctor
            .as_deref()
            .map(|d| !self.excluded_doctors.iter().any(|e| e.eq_ignore_ascii_case(d)))
            .unwrap_or(true);
        service_ok && doctor_ok
    }
}

fn matches_ci(current: Option<&str>, entity: &str) -> bool {
    current.map(|c| c.eq_ignore_ascii_case(entity)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_drops_matching_desire() {
        let mut c = ConversationConstraints::default();
        c.set_desired_service("whitening");
        c.exclude("whitening");
        assert!(c.desired_service.is_none());
        assert!(c.excluded_services.contains("whitening"));
        assert!(c.invariant_holds());
    }

    #[test]
    fn desire_lifts_exclusion() {
        let mut c = ConversationConstraints::default();
        c.exclude("cleaning");
        c.set_desired_service("cleaning");
        assert_eq!(c.desired_service.as_deref(), Some("cleaning"));
        assert!(!c.excluded_services.contains("cleaning"));
        assert!(c.invariant_holds());
    }

    #[test]
    fn switch_is_atomic() {
        let mut c = ConversationConstraints::default();
        c.set_desired_service("whitening");
        c.switch_service("whitening", "cleaning");
        assert_eq!(c.desired_service.as_deref(), Some("cleaning"));
        assert!(c.excluded_services.contains("whitening"));
        assert!(!c.excluded_services.contains("cleaning"));
        assert!(c.invariant_holds());
    }

    #[test]
    fn clear_empties_everything() {
        let mut c = ConversationConstraints::default();
        c.set_desired_service("cleaning");
        c.set_desired_doctor("Dr. Li");
        c.exclude("whitening");
        c.set_time_window("2026-08-02T09:00:00", "2026-08-02T12:00:00", "tomorrow morning");
        c.clear();
        assert!(c.is_empty());
    }
}
