pub mod agents;
pub mod classifier;
pub mod fallback;
pub mod orchestrator;
pub mod router;
pub mod workflow;

pub use classifier::RuleClassifier;
pub use fallback::{LocalResponse, LIMITED_MODE_REPLY};
pub use orchestrator::{AgentSummary, Orchestrator, Services};
pub use router::{normalize_intent_payload, route, route_to_workflow, RoutePlan};
pub use workflow::{
    StepOutcome, StepResult, StepRunner, WorkflowEngine, WorkflowResult, WorkflowState, WorkflowStatus,
    WorkflowStep,
};
