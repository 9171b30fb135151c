//! Recovers canonical [`ExerciseRecord`]s from agent output.
//!
//! Strategies run in priority order and the first that yields data wins:
//!
//! 1. Structured JSON: the first balanced JSON object carrying a workout key
//!    (`exercise`, `exercises`, `muscle_activations`, `structured_data`).
//! 2. Labelled sections: "Primary Muscles: ..." style headers, with per-band
//!    default weights. Volume comes from step 3.
//! 3. Volume phrases: "3 sets of 10 reps at 135 lbs", "3x8 @ 135lbs",
//!    "3 sets of squats at 225 lbs for 5 reps".
//!
//! Extraction is a pure function of the text and the [`BandWeights`]: the same
//! input always yields the same records.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::records::{
    ActivationLevel, ExerciseMetadata, ExerciseRecord, MAX_SETS, MuscleActivationRecord,
    normalize_muscle_name, set_volume,
};

pub const DEFAULT_PRIMARY_WEIGHT: f64 = 0.6;
pub const DEFAULT_SECONDARY_WEIGHT: f64 = 0.4;
pub const DEFAULT_TERTIARY_WEIGHT: f64 = 0.2;

const UNKNOWN_EXERCISE: &str = "unknown exercise";
const WORKOUT_KEYS: [&str; 4] = [
    "exercise",
    "exercises",
    "muscle_activations",
    "structured_data",
];
const MAX_SEARCH_DEPTH: u8 = 4;
const MAX_MUSCLE_TOKEN_WORDS: usize = 4;
const MAX_NAME_WORDS: usize = 5;

static SECTION_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\W*(?:(primary|secondary|tertiary)\s+muscles?|(stabiliz(?:ers?|ing\s+muscles?)))\b[^:\n]*:\s*(.*)$",
    )
    .expect("valid section header regex")
});
static BULLET_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s+(.+)$").expect("valid bullet regex")
});
static EXERCISE_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\W*exercise(?:\s+name)?\s*:\s*(.+)$").expect("valid exercise label regex")
});
static TOKEN_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*(?:,|;|/|&|\||\band\b)\s*").expect("valid token split regex")
});
static SETS_OF_REPS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d+)\s*sets?\s+of\s+(\d+)\s*(?:reps?|repetitions?)\b([^\n.;]*?)(\d+(?:\.\d+)?)\s*(?:lbs?|pounds?)\b",
    )
    .expect("valid sets-of-reps regex")
});
static SETS_BY_REPS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d+)\s*[x×]\s*(\d+)\s*(?:reps?\s*)?(?:@|at|with)\s*(\d+(?:\.\d+)?)\s*(?:lbs?|pounds?)\b",
    )
    .expect("valid sets-by-reps regex")
});
static SETS_OF_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d+)\s*sets?\s+of\s+([a-z][a-z \-]*?)\s+(?:at|@|with)\s*(\d+(?:\.\d+)?)\s*(?:lbs?|pounds?)[,\s]+(?:for\s+)?(\d+)\s*reps?\b",
    )
    .expect("valid sets-of-name regex")
});
static PER_LIMB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:per|each|in\s+each)\s+(?:hand|arm|side|dumbbell)s?\b")
        .expect("valid per-limb regex")
});
static TEMPO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\btempo\s*[:=]?\s*(\d-\d(?:-\d){1,2})\b").expect("valid tempo regex")
});
static RPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\brpe\s*[:=@]?\s*(\d+(?:\.\d+)?)\b").expect("valid rpe regex")
});
static REST_SECONDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\brest(?:ing)?\s*[:=]?\s*(\d{1,3})\s*(?:s|sec|secs|seconds?)\b")
        .expect("valid rest seconds regex")
});
static REST_MINUTES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\brest(?:ing)?\s*[:=]?\s*(\d{1,2}(?:\.\d+)?)\s*(?:m|min|mins|minutes?)\b")
        .expect("valid rest minutes regex")
});

/// Per-band default weights used when the agent names muscles without volumes.
/// Must satisfy `primary >= secondary >= tertiary > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BandWeights {
    pub primary: f64,
    pub secondary: f64,
    pub tertiary: f64,
}

impl Default for BandWeights {
    fn default() -> Self {
        Self {
            primary: DEFAULT_PRIMARY_WEIGHT,
            secondary: DEFAULT_SECONDARY_WEIGHT,
            tertiary: DEFAULT_TERTIARY_WEIGHT,
        }
    }
}

impl BandWeights {
    pub fn weight(&self, level: ActivationLevel) -> f64 {
        match level {
            ActivationLevel::Primary => self.primary,
            ActivationLevel::Secondary => self.secondary,
            ActivationLevel::Tertiary => self.tertiary,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.tertiary > 0.0 && self.secondary >= self.tertiary && self.primary >= self.secondary
    }
}

/// Which strategy produced the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    StructuredJson,
    LabelledSections,
    VolumePattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExtractedWorkout {
    /// Human-readable message to surface to the caller
    pub message: String,
    pub method: ExtractionMethod,
    pub exercises: Vec<ExerciseRecord>,
}

/// The agent replied, but neither muscle data nor a volume phrase could be found.
/// Callers degrade to returning the plain message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no structured workout data found in agent output")]
pub struct ExtractionIncomplete;

/// Agent output classified once at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentResponse {
    Message(String),
    StructuredPayload(ExtractedWorkout),
    Error(String),
}

impl AgentResponse {
    /// Classify a completed agent reply. A structured payload, when present,
    /// is preferred over the free text.
    pub fn from_output(text: &str, payload: Option<&Value>, weights: &BandWeights) -> Self {
        let extracted = match payload {
            Some(payload) => extract_with_payload(payload, text, weights),
            None => extract(text, weights),
        };
        match extracted {
            Ok(workout) => Self::StructuredPayload(workout),
            Err(ExtractionIncomplete) => Self::Message(text.trim().to_string()),
        }
    }
}

/// Run the three extraction strategies over `text`.
pub fn extract(text: &str, weights: &BandWeights) -> Result<ExtractedWorkout, ExtractionIncomplete> {
    if let Some(workout) = extract_structured_json(text, weights) {
        return Ok(workout);
    }

    let phrases = find_volume_phrases(text);

    if let Some(sections) = find_labelled_sections(text) {
        let phrase = phrases.first();
        let total_volume = phrase.map(VolumePhrase::total_volume).unwrap_or(0.0);
        let name = labelled_exercise_name(text)
            .or_else(|| phrase.and_then(|p| p.name.clone()))
            .unwrap_or_else(|| UNKNOWN_EXERCISE.to_string());

        let mut record = match phrase {
            Some(phrase) => phrase.to_record(text),
            None => bare_record(name.clone(), total_volume),
        };
        record.name = name;
        record.muscle_activations = distribute_by_band(&sections, total_volume, weights);

        return Ok(ExtractedWorkout {
            message: text.trim().to_string(),
            method: ExtractionMethod::LabelledSections,
            exercises: vec![record],
        });
    }

    if !phrases.is_empty() {
        return Ok(ExtractedWorkout {
            message: text.trim().to_string(),
            method: ExtractionMethod::VolumePattern,
            exercises: phrases.iter().map(|p| p.to_record(text)).collect(),
        });
    }

    Err(ExtractionIncomplete)
}

/// Extraction when the agent already emitted a structured payload next to its text.
pub fn extract_with_payload(
    payload: &Value,
    text: &str,
    weights: &BandWeights,
) -> Result<ExtractedWorkout, ExtractionIncomplete> {
    if let Some(workout_value) = locate_workout(payload, 0) {
        if let Some(workout) = workout_from_value(&workout_value, text, None, weights) {
            return Ok(workout);
        }
    }
    extract(text, weights)
}

// ---------------------------------------------------------------------------
// Strategy 1: structured JSON
// ---------------------------------------------------------------------------

fn extract_structured_json(text: &str, weights: &BandWeights) -> Option<ExtractedWorkout> {
    let mut cursor = 0;
    while let Some(relative) = text[cursor..].find('{') {
        let start = cursor + relative;
        let Some(candidate) = balanced_object_at(text, start) else {
            cursor = start + 1;
            continue;
        };
        match serde_json::from_str::<Value>(candidate) {
            Ok(value) => {
                if let Some(workout_value) = locate_workout(&value, 0) {
                    let surrounding = format!(
                        "{}{}",
                        &text[..start],
                        &text[start + candidate.len()..]
                    );
                    if let Some(workout) =
                        workout_from_value(&workout_value, text, Some(&surrounding), weights)
                    {
                        return Some(workout);
                    }
                }
                cursor = start + candidate.len();
            }
            Err(_) => cursor = start + 1,
        }
    }
    None
}

/// Slice of the balanced `{...}` starting at `start`, honoring JSON strings.
fn balanced_object_at(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// First object (searching nested values and JSON-in-string) with a workout key.
fn locate_workout(value: &Value, depth: u8) -> Option<Value> {
    if depth > MAX_SEARCH_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => {
            if WORKOUT_KEYS.iter().any(|key| map.contains_key(*key)) {
                return Some(value.clone());
            }
            map.values().find_map(|v| locate_workout(v, depth + 1))
        }
        Value::Array(items) => items.iter().find_map(|v| locate_workout(v, depth + 1)),
        Value::String(raw) if raw.trim_start().starts_with('{') => {
            serde_json::from_str::<Value>(raw.trim())
                .ok()
                .and_then(|parsed| locate_workout(&parsed, depth + 1))
        }
        _ => None,
    }
}

fn workout_from_value(
    value: &Value,
    text: &str,
    surrounding: Option<&str>,
    weights: &BandWeights,
) -> Option<ExtractedWorkout> {
    let map = value.as_object()?;

    if let Some(inner) = map.get("structured_data").and_then(Value::as_object) {
        let display = string_field(map, &["display_message", "message"]);
        let mut workout =
            workout_from_value(&Value::Object(inner.clone()), text, surrounding, weights)?;
        if let Some(display) = display {
            workout.message = display;
        }
        return Some(workout);
    }

    let fallback_phrase = find_volume_phrases(text).into_iter().next();
    let top_level_activations = map.get("muscle_activations").and_then(Value::as_array);

    let mut exercises = Vec::new();
    if let Some(items) = map.get("exercises").and_then(Value::as_array) {
        for item in items {
            if let Some(exercise) = item.as_object() {
                let activations = exercise
                    .get("muscle_activations")
                    .and_then(Value::as_array)
                    .or(top_level_activations);
                exercises.extend(exercise_from_map(
                    exercise,
                    activations,
                    fallback_phrase.as_ref(),
                    weights,
                ));
            }
        }
    } else if let Some(exercise_value) = map.get("exercise") {
        let exercise = match exercise_value {
            Value::Object(exercise) => exercise.clone(),
            Value::String(name) => {
                let mut synthetic = map.clone();
                synthetic.insert("name".to_string(), Value::String(name.clone()));
                synthetic
            }
            _ => map.clone(),
        };
        let activations = top_level_activations.or_else(|| {
            exercise
                .get("muscle_activations")
                .and_then(Value::as_array)
        });
        exercises.extend(exercise_from_map(
            &exercise,
            activations,
            fallback_phrase.as_ref(),
            weights,
        ));
    } else if top_level_activations.is_some() {
        exercises.extend(exercise_from_map(
            map,
            top_level_activations,
            fallback_phrase.as_ref(),
            weights,
        ));
    }

    if exercises.is_empty() {
        return None;
    }

    let message = string_field(map, &["display_message", "message"])
        .or_else(|| {
            surrounding
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("Logged {} exercise(s).", exercises.len()));

    Some(ExtractedWorkout {
        message,
        method: ExtractionMethod::StructuredJson,
        exercises,
    })
}

fn exercise_from_map(
    exercise: &Map<String, Value>,
    activations: Option<&Vec<Value>>,
    fallback_phrase: Option<&VolumePhrase>,
    weights: &BandWeights,
) -> Option<ExerciseRecord> {
    let sets_obj = exercise.get("sets").and_then(Value::as_object);
    let field = |key: &str| nested_or_flat(sets_obj, exercise, key);

    let set_count = sets_obj
        .and_then(|sets| sets.get("count"))
        .or_else(|| exercise.get("num_sets"))
        .or_else(|| exercise.get("sets").filter(|v| !v.is_object()))
        .and_then(as_number)
        .filter(|n| *n >= 0.0);
    if set_count.is_some_and(|n| n > f64::from(MAX_SETS)) {
        return None;
    }
    let set_count = set_count.map(|n| n.round() as u32);

    let mut reps = field("reps").and_then(|v| number_list(v, set_count));
    let mut weight = field("weight").and_then(|v| number_list(v, set_count));
    if let (Some(r), Some(w)) = (&mut reps, &mut weight) {
        broadcast_single(r, w.len());
        broadcast_single(w, r.len());
    }

    let computed = match (&reps, &weight) {
        (Some(r), Some(w)) => set_volume(r, w),
        _ => None,
    };
    let total_volume = computed
        .or_else(|| exercise.get("total_volume").and_then(as_number))
        .or_else(|| fallback_phrase.map(VolumePhrase::total_volume))
        .unwrap_or(0.0);

    let metadata_obj = exercise.get("metadata").and_then(Value::as_object);
    let meta = |key: &str| nested_or_flat(metadata_obj, exercise, key);
    let metadata = ExerciseMetadata {
        equipment: meta("equipment").and_then(as_text),
        difficulty: meta("difficulty").and_then(as_text),
        estimated_duration: meta("estimated_duration").and_then(as_number),
        rest_period: meta("rest_period").and_then(as_number),
    };

    let muscle_activations = activations
        .map(|items| activations_from_values(items, total_volume, weights))
        .unwrap_or_default();

    Some(ExerciseRecord {
        name: string_field(exercise, &["name", "exercise_name"])
            .unwrap_or_else(|| UNKNOWN_EXERCISE.to_string()),
        movement_pattern: string_field(exercise, &["movement_pattern"]),
        sets: set_count.or_else(|| reps.as_ref().map(|r| r.len() as u32)),
        reps,
        weight,
        rpe: field("rpe").and_then(as_number),
        tempo: field("tempo").and_then(as_text),
        notes: string_field(exercise, &["notes"]),
        metadata,
        total_volume,
        muscle_activations,
    })
}

fn activations_from_values(
    items: &[Value],
    total_volume: f64,
    weights: &BandWeights,
) -> Vec<MuscleActivationRecord> {
    let mut entries: Vec<(String, ActivationLevel, Option<f64>)> = Vec::new();
    for item in items {
        let Some(map) = item.as_object() else {
            continue;
        };
        let Some(name) = string_field(map, &["muscle_name", "muscle", "name"])
            .as_deref()
            .and_then(normalize_muscle_name)
        else {
            continue;
        };
        let Some(level) = string_field(map, &["activation_level", "level"])
            .as_deref()
            .and_then(ActivationLevel::parse)
        else {
            continue;
        };
        if entries.iter().any(|(existing, _, _)| *existing == name) {
            continue;
        }
        let raw = map
            .get("estimated_volume")
            .or_else(|| map.get("volume"))
            .and_then(as_number);
        entries.push((name, level, raw));
    }

    if entries.iter().all(|(_, _, raw)| raw.is_none()) {
        let banded: Vec<(String, ActivationLevel)> = entries
            .into_iter()
            .map(|(name, level, _)| (name, level))
            .collect();
        return distribute_by_band(&banded, total_volume, weights);
    }

    let reported: Vec<f64> = entries.iter().filter_map(|(_, _, raw)| *raw).collect();
    let unit = VolumeUnit::detect(&reported, total_volume);
    entries
        .into_iter()
        .map(|(muscle_name, activation_level, raw)| MuscleActivationRecord {
            muscle_name,
            activation_level,
            estimated_volume: unit.to_absolute(raw.unwrap_or(0.0), total_volume),
        })
        .collect()
}

/// How the agent expressed `estimated_volume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VolumeUnit {
    /// Shares in `0..=1`
    Fraction,
    /// Percentages in `0..=100`
    Percent,
    Absolute,
}

impl VolumeUnit {
    fn detect(reported: &[f64], total_volume: f64) -> Self {
        if total_volume <= 0.0 || reported.is_empty() {
            return Self::Absolute;
        }
        if reported.iter().all(|v| *v <= 1.0) {
            return Self::Fraction;
        }
        let sum: f64 = reported.iter().sum();
        if sum <= 100.0 + f64::EPSILON && total_volume > 100.0 {
            return Self::Percent;
        }
        Self::Absolute
    }

    fn to_absolute(self, raw: f64, total_volume: f64) -> f64 {
        match self {
            Self::Fraction => round_to_two(raw * total_volume),
            Self::Percent => round_to_two(raw / 100.0 * total_volume),
            Self::Absolute => raw,
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy 2: labelled sections
// ---------------------------------------------------------------------------

fn find_labelled_sections(text: &str) -> Option<Vec<(String, ActivationLevel)>> {
    let lines: Vec<&str> = text.lines().collect();
    let mut muscles: Vec<(String, ActivationLevel)> = Vec::new();
    let mut idx = 0;

    while idx < lines.len() {
        let Some(caps) = SECTION_HEADER_RE.captures(lines[idx]) else {
            idx += 1;
            continue;
        };
        let level = match caps.get(1) {
            Some(band) => ActivationLevel::parse(band.as_str()),
            None => Some(ActivationLevel::Tertiary),
        };
        let Some(level) = level else {
            idx += 1;
            continue;
        };

        let inline = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
        push_muscle_tokens(inline, level, &mut muscles);

        idx += 1;
        while idx < lines.len() && !SECTION_HEADER_RE.is_match(lines[idx]) {
            match BULLET_LINE_RE.captures(lines[idx]) {
                Some(bullet) => {
                    let item = bullet.get(1).map(|m| m.as_str()).unwrap_or_default();
                    push_muscle_tokens(item, level, &mut muscles);
                    idx += 1;
                }
                None => break,
            }
        }
    }

    if muscles.is_empty() { None } else { Some(muscles) }
}

fn push_muscle_tokens(raw: &str, level: ActivationLevel, out: &mut Vec<(String, ActivationLevel)>) {
    for token in TOKEN_SPLIT_RE.split(raw) {
        let words = token
            .split('(')
            .next()
            .unwrap_or_default()
            .split_whitespace()
            .count();
        if words == 0 || words > MAX_MUSCLE_TOKEN_WORDS {
            continue;
        }
        let Some(name) = normalize_muscle_name(token) else {
            continue;
        };
        if out.iter().any(|(existing, _)| *existing == name) {
            continue;
        }
        out.push((name, level));
    }
}

/// Split `total_volume` across muscles in proportion to their band weight.
/// Shares sum to the total and keep band order.
fn distribute_by_band(
    muscles: &[(String, ActivationLevel)],
    total_volume: f64,
    weights: &BandWeights,
) -> Vec<MuscleActivationRecord> {
    let weight_sum: f64 = muscles.iter().map(|(_, level)| weights.weight(*level)).sum();
    muscles
        .iter()
        .map(|(name, level)| {
            let share = if weight_sum > 0.0 {
                weights.weight(*level) / weight_sum
            } else {
                0.0
            };
            MuscleActivationRecord {
                muscle_name: name.clone(),
                activation_level: *level,
                estimated_volume: round_to_two(total_volume * share),
            }
        })
        .collect()
}

fn labelled_exercise_name(text: &str) -> Option<String> {
    let caps = EXERCISE_LABEL_RE.captures(text)?;
    clean_name(caps.get(1)?.as_str())
}

// ---------------------------------------------------------------------------
// Strategy 3: volume phrases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct VolumePhrase {
    name: Option<String>,
    sets: u32,
    reps: f64,
    /// Effective weight, already doubled for per-limb loads
    weight: f64,
    start: usize,
    end: usize,
}

impl VolumePhrase {
    fn total_volume(&self) -> f64 {
        f64::from(self.sets) * self.reps * self.weight
    }

    fn to_record(&self, text: &str) -> ExerciseRecord {
        let line = line_around(text, self.start);
        let count = self.sets as usize;
        let reps = vec![self.reps; count];
        let weight = vec![self.weight; count];
        let total_volume = set_volume(&reps, &weight).unwrap_or(0.0);

        ExerciseRecord {
            name: self
                .name
                .clone()
                .unwrap_or_else(|| UNKNOWN_EXERCISE.to_string()),
            movement_pattern: None,
            sets: Some(self.sets),
            reps: Some(reps),
            weight: Some(weight),
            rpe: RPE_RE
                .captures(line)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .filter(|rpe| (0.0..=10.0).contains(rpe)),
            tempo: TEMPO_RE
                .captures(line)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string()),
            notes: None,
            metadata: ExerciseMetadata {
                rest_period: parse_rest_seconds(line),
                ..ExerciseMetadata::default()
            },
            total_volume,
            muscle_activations: Vec::new(),
        }
    }
}

fn find_volume_phrases(text: &str) -> Vec<VolumePhrase> {
    let mut phrases: Vec<VolumePhrase> = Vec::new();

    for caps in SETS_OF_REPS_RE.captures_iter(text) {
        let (Some(full), Some(sets), Some(reps), Some(weight)) =
            (caps.get(0), caps.get(1), caps.get(2), caps.get(4))
        else {
            continue;
        };
        let middle = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
        let name = clean_name(middle).or_else(|| trailing_name(text, full.end()));
        push_phrase(&mut phrases, text, name, sets.as_str(), reps.as_str(), weight.as_str(), full.start(), full.end());
    }

    for caps in SETS_BY_REPS_RE.captures_iter(text) {
        let (Some(full), Some(sets), Some(reps), Some(weight)) =
            (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
        else {
            continue;
        };
        let name = leading_name(text, full.start()).or_else(|| trailing_name(text, full.end()));
        push_phrase(&mut phrases, text, name, sets.as_str(), reps.as_str(), weight.as_str(), full.start(), full.end());
    }

    for caps in SETS_OF_NAME_RE.captures_iter(text) {
        let (Some(full), Some(sets), Some(name), Some(weight), Some(reps)) =
            (caps.get(0), caps.get(1), caps.get(2), caps.get(3), caps.get(4))
        else {
            continue;
        };
        let name = clean_name(name.as_str());
        push_phrase(&mut phrases, text, name, sets.as_str(), reps.as_str(), weight.as_str(), full.start(), full.end());
    }

    phrases.sort_by_key(|p| p.start);
    phrases
}

#[allow(clippy::too_many_arguments)]
fn push_phrase(
    phrases: &mut Vec<VolumePhrase>,
    text: &str,
    name: Option<String>,
    sets: &str,
    reps: &str,
    weight: &str,
    start: usize,
    end: usize,
) {
    if phrases.iter().any(|p| start < p.end && p.start < end) {
        return;
    }
    let (Ok(sets), Ok(reps), Ok(weight)) = (
        sets.parse::<u32>(),
        reps.parse::<f64>(),
        weight.parse::<f64>(),
    ) else {
        return;
    };
    if sets == 0 || sets > MAX_SETS {
        return;
    }
    let clause = &text[start..clause_end(text, end)];
    let weight = if PER_LIMB_RE.is_match(clause) {
        weight * 2.0
    } else {
        weight
    };
    phrases.push(VolumePhrase {
        name,
        sets,
        reps,
        weight,
        start,
        end,
    });
}

/// End of the clause containing `from`: next '.', ';' or newline, skipping decimal points.
fn clause_end(text: &str, from: usize) -> usize {
    let bytes = text.as_bytes();
    let mut idx = from;
    while idx < bytes.len() {
        match bytes[idx] {
            b'\n' | b';' => return idx,
            b'.' => {
                let next_is_digit = bytes.get(idx + 1).is_some_and(u8::is_ascii_digit);
                let prev_is_digit = idx > 0 && bytes[idx - 1].is_ascii_digit();
                if !(next_is_digit && prev_is_digit) {
                    return idx;
                }
            }
            _ => {}
        }
        idx += 1;
    }
    bytes.len()
}

fn line_around(text: &str, position: usize) -> &str {
    let start = text[..position].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let end = text[position..]
        .find('\n')
        .map(|i| position + i)
        .unwrap_or(text.len());
    &text[start..end]
}

fn trailing_name(text: &str, from: usize) -> Option<String> {
    let clause = &text[from..clause_end(text, from)];
    let without_qualifier = PER_LIMB_RE.replace_all(clause, " ");
    let head = without_qualifier.split(',').next().unwrap_or_default();
    clean_name(head)
}

fn leading_name(text: &str, position: usize) -> Option<String> {
    let line_start = text[..position].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let prefix = &text[line_start..position];
    let prefix = prefix.trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')');
    clean_name(prefix)
}

const CONNECTOR_WORDS: [&str; 12] = [
    "at", "@", "with", "using", "of", "on", "the", "each", "for", "x", "did", "a",
];

/// Trim connector words and punctuation; `None` when no name-like words remain.
fn clean_name(raw: &str) -> Option<String> {
    let words: Vec<String> = raw
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '-'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();

    let is_connector = |w: &String| CONNECTOR_WORDS.contains(&w.as_str());
    let first = words.iter().position(|w| !is_connector(w))?;
    let last = words.iter().rposition(|w| !is_connector(w))?;
    let kept = &words[first..=last];

    if kept.len() > MAX_NAME_WORDS || kept.iter().any(|w| w.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }
    Some(kept.join(" "))
}

fn parse_rest_seconds(text: &str) -> Option<f64> {
    if let Some(seconds) = REST_SECONDS_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Some(seconds);
    }
    REST_MINUTES_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|minutes| round_to_two(minutes * 60.0))
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

fn round_to_two(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn bare_record(name: String, total_volume: f64) -> ExerciseRecord {
    ExerciseRecord {
        name,
        movement_pattern: None,
        sets: None,
        reps: None,
        weight: None,
        rpe: None,
        tempo: None,
        notes: None,
        metadata: ExerciseMetadata::default(),
        total_volume,
        muscle_activations: Vec::new(),
    }
}

/// `key` from the nested object when present there, else from the flat one.
fn nested_or_flat<'a>(
    nested: Option<&'a Map<String, Value>>,
    flat: &'a Map<String, Value>,
    key: &str,
) -> Option<&'a Value> {
    nested.and_then(|m| m.get(key)).or_else(|| flat.get(key))
}

fn string_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find_map(as_text)
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .trim_end_matches('%')
            .trim_end_matches("lbs")
            .trim_end_matches("lb")
            .trim()
            .parse::<f64>()
            .ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

/// Per-set array from either an array or a scalar repeated `count` times.
fn number_list(value: &Value, count: Option<u32>) -> Option<Vec<f64>> {
    match value {
        Value::Array(items) => {
            let numbers: Vec<f64> = items.iter().filter_map(as_number).collect();
            if numbers.len() == items.len() && !numbers.is_empty() {
                Some(numbers)
            } else {
                None
            }
        }
        other => {
            let n = as_number(other)?;
            Some(vec![n; count.unwrap_or(1).max(1) as usize])
        }
    }
}

fn broadcast_single(values: &mut Vec<f64>, len: usize) {
    if values.len() == 1 && len > 1 {
        let value = values[0];
        values.resize(len, value);
    }
}

// ---------------------------------------------------------------------------
// Incremental extraction for streamed output
// ---------------------------------------------------------------------------

/// Accumulates streamed fragments. JSON-only extraction is attempted as soon as
/// a closing brace arrives so streaming callers can surface muscle data early;
/// [`ExtractionBuffer::finish`] runs the full strategy chain on everything.
#[derive(Debug, Clone)]
pub struct ExtractionBuffer {
    text: String,
    payload: Option<Value>,
    weights: BandWeights,
    preview_emitted: bool,
}

impl ExtractionBuffer {
    pub fn new(weights: BandWeights) -> Self {
        Self {
            text: String::new(),
            payload: None,
            weights,
            preview_emitted: false,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Append a text fragment. Returns the first complete structured record set, once.
    pub fn push_text(&mut self, fragment: &str) -> Option<ExtractedWorkout> {
        self.text.push_str(fragment);
        if self.preview_emitted || !fragment.contains('}') {
            return None;
        }
        let preview = extract_structured_json(&self.text, &self.weights)?;
        self.preview_emitted = true;
        Some(preview)
    }

    /// Record a structured payload chunk. The latest payload wins.
    pub fn push_payload(&mut self, payload: Value) -> Option<ExtractedWorkout> {
        let preview = if self.preview_emitted {
            None
        } else {
            locate_workout(&payload, 0)
                .and_then(|value| workout_from_value(&value, &self.text, None, &self.weights))
        };
        if preview.is_some() {
            self.preview_emitted = true;
        }
        self.payload = Some(payload);
        preview
    }

    pub fn finish(self) -> Result<ExtractedWorkout, ExtractionIncomplete> {
        match &self.payload {
            Some(payload) => extract_with_payload(payload, &self.text, &self.weights),
            None => extract(&self.text, &self.weights),
        }
    }
}
