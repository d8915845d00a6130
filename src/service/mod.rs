//! Code generator and document validation services.

mod codegen;
mod validation;
pub use codegen::{generate, CodeGenerator, CountersSchema, COUNTERS_COLLECTION};
pub use validation::DocumentValidator;
