pub mod attempt;
pub mod directory;
pub mod form_schema;
pub mod loaders;
pub mod product;
pub mod state_machine;
pub mod submission;

pub use attempt::{
    AttemptOutcome, AttemptRecord, AttemptStep, ConfirmationSignal, FailureKind, StepLog,
    StepStatus,
};
pub use directory::{CachedSchema, Directory, DirectoryId, DirectoryOutcome, SchemaFeedback};
pub use form_schema::{
    FieldKind, FieldMapping, FilledField, FormField, FormSchema, PageSnapshot, SchemaSource,
    SemanticType,
};
pub use loaders::{load_seed_file, parse_seed, SeedData, SubmissionSeed};
pub use product::{Product, ProductId};
pub use state_machine::{SubmissionStatus, Transition};
pub use submission::{ClaimLease, ClaimToken, Submission, SubmissionId};
