//! Orchestration of multi-step workflows.

pub mod saga;

pub use saga::{
    CompensationFailure, SagaContext, SagaError, SagaExecution, SagaOrchestrator, SagaStatus,
    SagaStep,
};
