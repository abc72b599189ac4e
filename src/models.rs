use time::OffsetDateTime;

/// Which load cell (or aggregate) a weight report belongs to.
///
/// The scale reports each load cell as a separate BLE "user".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorId {
    Total,
    UpperLeft,
    LowerLeft,
    UpperRight,
    LowerRight,
    /// Transient report sent while the scale is resetting; never stored.
    Reset,
}

impl SensorId {
    /// Number of ids that make up one complete record.
    pub const RECORD_SLOTS: usize = 5;

    pub fn from_raw(raw: u8) -> Option<SensorId> {
        match raw {
            0 => Some(SensorId::Total),
            1 => Some(SensorId::UpperLeft),
            2 => Some(SensorId::LowerLeft),
            3 => Some(SensorId::UpperRight),
            4 => Some(SensorId::LowerRight),
            5 => Some(SensorId::Reset),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            SensorId::Total => 0,
            SensorId::UpperLeft => 1,
            SensorId::LowerLeft => 2,
            SensorId::UpperRight => 3,
            SensorId::LowerRight => 4,
            SensorId::Reset => 5,
        }
    }

    fn slot(self) -> Option<usize> {
        match self {
            SensorId::Reset => None,
            other => Some(other.as_raw() as usize),
        }
    }
}

/// One decoded weight report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub sensor_id: SensorId,
    pub weight_kg: f64,
}

/// What happened to a measurement folded into a [`PartialRecord`].
#[derive(Debug, Clone, PartialEq)]
pub enum FoldOutcome {
    /// Value stored, record still incomplete.
    Stored,
    /// A TOTAL arrived mid-record; the record restarted from it.
    Restarted,
    /// Reset pseudo-reading, dropped.
    IgnoredReset,
    /// Directional report before any TOTAL, dropped.
    IgnoredBeforeTotal,
    /// Slot already filled, first value kept.
    IgnoredDuplicate,
    /// All five slots filled.
    Complete(CompletedRecord),
}

/// In-progress set of weights for one session.
///
/// Slots are indexed by the raw sensor id (TOTAL = 0 .. LOWER_RIGHT = 4).
#[derive(Debug, Clone, Default)]
pub struct PartialRecord {
    weights: [Option<f64>; SensorId::RECORD_SLOTS],
}

impl PartialRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every slot back to unset.
    pub fn reset(&mut self) {
        self.weights = [None; SensorId::RECORD_SLOTS];
    }

    pub fn get(&self, sensor_id: SensorId) -> Option<f64> {
        sensor_id.slot().and_then(|slot| self.weights[slot])
    }

    pub fn filled(&self) -> usize {
        self.weights.iter().filter(|w| w.is_some()).count()
    }

    /// Fold one measurement into the record
    ///
    /// A record always starts with TOTAL: directional reports arriving
    /// before it are dropped. A second TOTAL means the scale started a new
    /// set, so the record restarts from it. Directional duplicates keep the
    /// first value. Once all five slots are set the record is consumed and
    /// its snapshot returned; the partial record is left empty.
    pub fn fold(&mut self, measurement: Measurement) -> FoldOutcome {
        let slot = match measurement.sensor_id.slot() {
            Some(slot) => slot,
            None => return FoldOutcome::IgnoredReset,
        };

        let outcome = if measurement.sensor_id == SensorId::Total {
            let restarted = self.filled() > 0;
            self.reset();
            self.weights[slot] = Some(measurement.weight_kg);
            if restarted {
                FoldOutcome::Restarted
            } else {
                FoldOutcome::Stored
            }
        } else if self.get(SensorId::Total).is_none() {
            return FoldOutcome::IgnoredBeforeTotal;
        } else if self.weights[slot].is_some() {
            return FoldOutcome::IgnoredDuplicate;
        } else {
            self.weights[slot] = Some(measurement.weight_kg);
            FoldOutcome::Stored
        };

        match self.take_completed() {
            Some(record) => FoldOutcome::Complete(record),
            None => outcome,
        }
    }

    fn take_completed(&mut self) -> Option<CompletedRecord> {
        let record = CompletedRecord {
            total_kg: self.get(SensorId::Total)?,
            upper_left_kg: self.get(SensorId::UpperLeft)?,
            upper_right_kg: self.get(SensorId::UpperRight)?,
            lower_left_kg: self.get(SensorId::LowerLeft)?,
            lower_right_kg: self.get(SensorId::LowerRight)?,
            measured_at: OffsetDateTime::now_utc(),
        };
        self.reset();
        Some(record)
    }
}

/// A full set of weights ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRecord {
    pub total_kg: f64,
    pub upper_left_kg: f64,
    pub upper_right_kg: f64,
    pub lower_left_kg: f64,
    pub lower_right_kg: f64,
    pub measured_at: OffsetDateTime,
}

impl CompletedRecord {
    /// Collector field names paired with their values, in upload order.
    pub fn fields(&self) -> [(&'static str, f64); 5] {
        [
            ("total_kg", self.total_kg),
            ("ul_kg", self.upper_left_kg),
            ("ur_kg", self.upper_right_kg),
            ("ll_kg", self.lower_left_kg),
            ("lr_kg", self.lower_right_kg),
        ]
    }
}
