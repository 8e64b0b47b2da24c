pub mod detection;
pub mod field_mapper;
pub mod llm_service;
pub mod retry_policy;
pub mod review_writer;

pub use detection::{DetectionFailure, DetectionFailureReason, DetectionGateway, FormDetector};
pub use field_mapper::{map_fields, FieldMapOutcome, MappingIncomplete};
pub use llm_service::LlmService;
pub use retry_policy::{RetryDecision, RetryPolicy};
pub use review_writer::ReviewWriter;
