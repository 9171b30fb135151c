use std::sync::Arc;

use crate::aggregator::MuscleVolumeAggregator;
use crate::pipeline::WorkoutPipeline;
use crate::store::WorkoutStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WorkoutStore>,
    pub pipeline: WorkoutPipeline,
    pub aggregator: MuscleVolumeAggregator,
}
