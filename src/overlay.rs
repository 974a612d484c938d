//! Client-side predictions shown ahead of polled state.
//!
//! The device acknowledges a command before the unit physically changes, so
//! the next poll can still report the old value. A prediction therefore
//! stays authoritative for a fixed hold window, then yields to polled data
//! whatever it says. A failed command drops its prediction at once.

use crate::model::{FieldMap, FieldValue};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControlField {
    Power,
    TemperatureTarget,
    SpeedTarget,
    ModeSet,
}

impl ControlField {
    /// Name of the snapshot field this control overrides.
    pub fn key(self) -> &'static str {
        match self {
            ControlField::Power => "power",
            ControlField::TemperatureTarget => "temperature_target",
            ControlField::SpeedTarget => "speed_target",
            ControlField::ModeSet => "mode_set",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticCommand {
    pub field: ControlField,
    pub value: FieldValue,
    pub issued_at: Instant,
    seq: u64,
}

/// Identifies one prediction so a late failure cannot clear a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictionId(u64);

#[derive(Debug)]
pub struct OptimisticOverlay {
    hold: Duration,
    next_seq: u64,
    pending: BTreeMap<ControlField, OptimisticCommand>,
}

impl OptimisticOverlay {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            next_seq: 0,
            pending: BTreeMap::new(),
        }
    }

    pub fn predict(&mut self, field: ControlField, value: FieldValue, now: Instant) -> PredictionId {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.pending.insert(
            field,
            OptimisticCommand {
                field,
                value,
                issued_at: now,
                seq,
            },
        );
        PredictionId(seq)
    }

    /// Drop a prediction whose command failed, bypassing the hold window.
    pub fn fail(&mut self, field: ControlField, id: PredictionId) {
        if self.pending.get(&field).is_some_and(|c| c.seq == id.0) {
            self.pending.remove(&field);
        }
    }

    /// A new snapshot arrived: forget predictions older than the hold window.
    pub fn on_snapshot(&mut self, now: Instant) {
        let hold = self.hold;
        self.pending
            .retain(|_, c| now.saturating_duration_since(c.issued_at) <= hold);
    }

    pub fn get(&self, field: ControlField, now: Instant) -> Option<&FieldValue> {
        self.pending
            .get(&field)
            .filter(|c| self.is_live(c, now))
            .map(|c| &c.value)
    }

    /// Overlay live predictions onto a snapshot's field map.
    pub fn apply(&self, fields: &mut FieldMap, now: Instant) {
        for c in self.pending.values().filter(|c| self.is_live(c, now)) {
            fields.insert(c.field.key(), Some(c.value.clone()));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn is_live(&self, c: &OptimisticCommand, now: Instant) -> bool {
        now.saturating_duration_since(c.issued_at) <= self.hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HOLD: Duration = Duration::from_secs(6);

    fn polled(target: i64) -> FieldMap {
        let mut m = FieldMap::new();
        m.insert("temperature_target", Some(FieldValue::I64(target)));
        m.insert("power", Some(FieldValue::Bool(false)));
        m
    }

    #[test]
    fn test_prediction_visible_immediately() {
        let t0 = Instant::now();
        let mut overlay = OptimisticOverlay::new(HOLD);
        overlay.predict(ControlField::TemperatureTarget, FieldValue::I64(22), t0);

        let mut fields = polled(20);
        overlay.apply(&mut fields, t0);
        assert_eq!(fields["temperature_target"], Some(FieldValue::I64(22)));
        assert_eq!(fields["power"], Some(FieldValue::Bool(false)));
    }

    #[test]
    fn test_prediction_survives_disagreeing_snapshot_inside_window() {
        let t0 = Instant::now();
        let mut overlay = OptimisticOverlay::new(HOLD);
        overlay.predict(ControlField::TemperatureTarget, FieldValue::I64(22), t0);

        overlay.on_snapshot(t0 + Duration::from_secs(3));
        let mut fields = polled(20);
        overlay.apply(&mut fields, t0 + Duration::from_secs(3));
        assert_eq!(fields["temperature_target"], Some(FieldValue::I64(22)));
    }

    #[test]
    fn test_prediction_expires_after_window_without_snapshot() {
        let t0 = Instant::now();
        let mut overlay = OptimisticOverlay::new(HOLD);
        overlay.predict(ControlField::TemperatureTarget, FieldValue::I64(22), t0);

        let later = t0 + Duration::from_secs(7);
        assert_eq!(overlay.get(ControlField::TemperatureTarget, later), None);
        let mut fields = polled(20);
        overlay.apply(&mut fields, later);
        assert_eq!(fields["temperature_target"], Some(FieldValue::I64(20)));
    }

    #[test]
    fn test_snapshot_after_window_clears_prediction() {
        let t0 = Instant::now();
        let mut overlay = OptimisticOverlay::new(HOLD);
        overlay.predict(ControlField::Power, FieldValue::Bool(true), t0);

        overlay.on_snapshot(t0 + Duration::from_secs(6));
        assert!(!overlay.is_empty());
        overlay.on_snapshot(t0 + Duration::from_millis(6001));
        assert!(overlay.is_empty());
    }

    #[test]
    fn test_failure_clears_immediately() {
        let t0 = Instant::now();
        let mut overlay = OptimisticOverlay::new(HOLD);
        let id = overlay.predict(ControlField::TemperatureTarget, FieldValue::I64(22), t0);

        overlay.fail(ControlField::TemperatureTarget, id);
        assert_eq!(overlay.get(ControlField::TemperatureTarget, t0), None);
        assert!(overlay.is_empty());
    }

    #[test]
    fn test_stale_failure_keeps_newer_prediction() {
        let t0 = Instant::now();
        let mut overlay = OptimisticOverlay::new(HOLD);
        let first = overlay.predict(ControlField::SpeedTarget, FieldValue::I64(3), t0);
        overlay.predict(
            ControlField::SpeedTarget,
            FieldValue::I64(5),
            t0 + Duration::from_secs(1),
        );

        overlay.fail(ControlField::SpeedTarget, first);
        assert_eq!(
            overlay.get(ControlField::SpeedTarget, t0 + Duration::from_secs(1)),
            Some(&FieldValue::I64(5))
        );
    }
}
