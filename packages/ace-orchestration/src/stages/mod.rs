// Stage implementations
pub mod formatting_stage;
pub mod integration_stage;
pub mod repair_stage;
pub mod summary_stage;
pub mod validation_stage;

use crate::pipeline::StageHandler;
use std::sync::Arc;

// Re-exports
pub use formatting_stage::FormattingStage;
pub use integration_stage::IntegrationStage;
pub use repair_stage::{RepairStage, RepairStats};
pub use summary_stage::SummaryStage;
pub use validation_stage::{Check, ValidationStage};

/// One handler per stage, in pipeline order
pub fn default_handlers() -> Vec<Arc<dyn StageHandler>> {
    vec![
        Arc::new(FormattingStage),
        Arc::new(RepairStage),
        Arc::new(SummaryStage),
        Arc::new(IntegrationStage),
        Arc::new(ValidationStage),
    ]
}
