use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Relative tolerance when comparing a reported total volume with the per-set sum.
const VOLUME_TOLERANCE: f64 = 1e-6;

/// Upper bound on sets per exercise. Larger counts are treated as garbage input.
pub const MAX_SETS: u32 = 100;

/// Qualitative band describing how much a muscle contributes to an exercise's load.
/// Declaration order is strongest first, so `Primary < Secondary < Tertiary`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivationLevel {
    Primary,
    Secondary,
    Tertiary,
}

impl ActivationLevel {
    pub const ALL: [ActivationLevel; 3] = [Self::Primary, Self::Secondary, Self::Tertiary];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "PRIMARY",
            Self::Secondary => "SECONDARY",
            Self::Tertiary => "TERTIARY",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "PRIMARY" => Some(Self::Primary),
            "SECONDARY" => Some(Self::Secondary),
            "TERTIARY" => Some(Self::Tertiary),
            _ => None,
        }
    }

    /// Lenient parse for agent output: "primary", " Secondary ", "TERTIARY".
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PRIMARY" => Some(Self::Primary),
            "SECONDARY" => Some(Self::Secondary),
            "TERTIARY" => Some(Self::Tertiary),
            _ => None,
        }
    }
}

/// Normalize a muscle name to a lower-case token: "Rear Deltoid" -> "rear_deltoid".
///
/// Parenthetical notes and surrounding punctuation are dropped. Returns `None`
/// when nothing usable remains.
pub fn normalize_muscle_name(raw: &str) -> Option<String> {
    let without_note = match raw.find('(') {
        Some(idx) => &raw[..idx],
        None => raw,
    };
    let token = without_note
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .map(|part| part.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_");

    if token.is_empty() { None } else { Some(token) }
}

/// Optional descriptive metadata the agent may attach to an exercise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExerciseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    /// Minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<f64>,
    /// Seconds between sets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest_period: Option<f64>,
}

/// One muscle's share of an exercise, in absolute volume units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MuscleActivationRecord {
    pub muscle_name: String,
    pub activation_level: ActivationLevel,
    pub estimated_volume: f64,
}

/// Canonical exercise produced by extraction, independent of the agent's output format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExerciseRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub movement_pattern: Option<String>,
    /// Number of sets, when reported separately from the per-set arrays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sets: Option<u32>,
    /// Reps per set; parallel to `weight`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reps: Option<Vec<f64>>,
    /// Weight per set (lbs); parallel to `reps`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpe: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub metadata: ExerciseMetadata,
    pub total_volume: f64,
    #[serde(default)]
    pub muscle_activations: Vec<MuscleActivationRecord>,
}

/// A rejected field. Aborts a write before anything is persisted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
    pub received: Option<serde_json::Value>,
}

impl ValidationIssue {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            received: None,
        }
    }

    fn with_received(mut self, value: serde_json::Value) -> Self {
        self.received = Some(value);
        self
    }
}

/// Sum of `reps[i] * weight[i]`, or `None` when the arrays differ in length.
pub fn set_volume(reps: &[f64], weight: &[f64]) -> Option<f64> {
    if reps.len() != weight.len() {
        return None;
    }
    Some(reps.iter().zip(weight).map(|(r, w)| r * w).sum())
}

fn volumes_match(reported: f64, computed: f64) -> bool {
    (reported - computed).abs() <= VOLUME_TOLERANCE * computed.abs().max(1.0)
}

fn check_non_negative(field: &str, values: &[f64]) -> Result<(), ValidationIssue> {
    for (idx, value) in values.iter().enumerate() {
        if !value.is_finite() || *value < 0.0 {
            return Err(ValidationIssue::new(
                format!("{field}[{idx}]"),
                "must be a non-negative number",
            )
            .with_received(serde_json::json!(value)));
        }
    }
    Ok(())
}

impl ExerciseRecord {
    /// Volume derived from the per-set arrays, when both are present and parallel.
    pub fn computed_volume(&self) -> Option<f64> {
        match (&self.reps, &self.weight) {
            (Some(reps), Some(weight)) => set_volume(reps, weight),
            _ => None,
        }
    }

    pub fn activation_volume_sum(&self) -> f64 {
        self.muscle_activations
            .iter()
            .map(|a| a.estimated_volume)
            .sum()
    }

    /// Copy with every muscle name in canonical form ("Chest " -> "chest"),
    /// validated. This is what the store persists.
    pub fn normalized(&self) -> Result<ExerciseRecord, ValidationIssue> {
        let mut record = self.clone();
        for (idx, activation) in record.muscle_activations.iter_mut().enumerate() {
            activation.muscle_name = normalize_muscle_name(&activation.muscle_name).ok_or_else(|| {
                ValidationIssue::new(
                    format!("muscle_activations[{idx}].muscle_name"),
                    "must contain a letter or digit",
                )
                .with_received(serde_json::json!(activation.muscle_name))
            })?;
        }
        record.validate()?;
        Ok(record)
    }

    /// Structural checks applied before any row is written. Muscle names must
    /// already be canonical; see [`ExerciseRecord::normalized`].
    pub fn validate(&self) -> Result<(), ValidationIssue> {
        if self.name.trim().is_empty() {
            return Err(ValidationIssue::new("name", "must not be empty"));
        }

        if let Some(sets) = self.sets {
            if sets > MAX_SETS {
                return Err(ValidationIssue::new("sets", format!("must be at most {MAX_SETS}"))
                    .with_received(serde_json::json!(sets)));
            }
        }
        for (field, values) in [("reps", &self.reps), ("weight", &self.weight)] {
            if values.as_ref().is_some_and(|v| v.len() > MAX_SETS as usize) {
                return Err(ValidationIssue::new(
                    field,
                    format!("must have at most {MAX_SETS} entries"),
                ));
            }
        }

        if let Some(reps) = &self.reps {
            check_non_negative("reps", reps)?;
        }
        if let Some(weight) = &self.weight {
            check_non_negative("weight", weight)?;
        }

        if !self.total_volume.is_finite() || self.total_volume < 0.0 {
            return Err(
                ValidationIssue::new("total_volume", "must be a non-negative number")
                    .with_received(serde_json::json!(self.total_volume)),
            );
        }

        if let (Some(reps), Some(weight)) = (&self.reps, &self.weight) {
            let Some(computed) = set_volume(reps, weight) else {
                return Err(ValidationIssue::new(
                    "weight",
                    format!(
                        "reps and weight must have one entry per set (got {} reps, {} weights)",
                        reps.len(),
                        weight.len()
                    ),
                ));
            };
            if !volumes_match(self.total_volume, computed) {
                return Err(ValidationIssue::new(
                    "total_volume",
                    format!("must equal the sum of reps x weight ({computed})"),
                )
                .with_received(serde_json::json!(self.total_volume)));
            }
        }

        if let Some(rpe) = self.rpe {
            if !(0.0..=10.0).contains(&rpe) {
                return Err(ValidationIssue::new("rpe", "must be between 0 and 10")
                    .with_received(serde_json::json!(rpe)));
            }
        }

        for (idx, activation) in self.muscle_activations.iter().enumerate() {
            if activation.muscle_name.trim().is_empty() {
                return Err(ValidationIssue::new(
                    format!("muscle_activations[{idx}].muscle_name"),
                    "must not be empty",
                ));
            }
            if normalize_muscle_name(&activation.muscle_name).as_deref()
                != Some(activation.muscle_name.as_str())
            {
                return Err(ValidationIssue::new(
                    format!("muscle_activations[{idx}].muscle_name"),
                    "must be a lower-case token such as \"rear_delts\"",
                )
                .with_received(serde_json::json!(activation.muscle_name)));
            }
            if !activation.estimated_volume.is_finite() || activation.estimated_volume < 0.0 {
                return Err(ValidationIssue::new(
                    format!("muscle_activations[{idx}].estimated_volume"),
                    "must be a non-negative number",
                )
                .with_received(serde_json::json!(activation.estimated_volume)));
            }
            if self.muscle_activations[..idx]
                .iter()
                .any(|earlier| earlier.muscle_name == activation.muscle_name)
            {
                return Err(ValidationIssue::new(
                    format!("muscle_activations[{idx}].muscle_name"),
                    "each muscle may appear once per exercise",
                )
                .with_received(serde_json::json!(activation.muscle_name)));
            }
        }

        Ok(())
    }

    /// Reports a weaker band carrying more volume than a stronger one.
    /// Not fatal: agents occasionally disagree with their own labels.
    pub fn band_order_violation(&self) -> Option<ValidationIssue> {
        for pair in ActivationLevel::ALL.windows(2) {
            let (stronger, weaker) = (pair[0], pair[1]);
            let stronger_min = self
                .muscle_activations
                .iter()
                .filter(|a| a.activation_level == stronger)
                .map(|a| a.estimated_volume)
                .reduce(f64::min);
            let weaker_max = self
                .muscle_activations
                .iter()
                .filter(|a| a.activation_level == weaker)
                .map(|a| a.estimated_volume)
                .reduce(f64::max);
            if let (Some(lo), Some(hi)) = (stronger_min, weaker_max) {
                if hi > lo {
                    return Some(ValidationIssue::new(
                        "muscle_activations",
                        format!(
                            "{} muscle carries {hi} but a {} muscle only {lo}",
                            weaker.as_str(),
                            stronger.as_str()
                        ),
                    ));
                }
            }
        }
        None
    }
}
