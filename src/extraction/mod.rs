pub mod context;
pub mod extractor;
pub mod orchestrator;
pub mod parser;
pub mod router;
pub mod structured;
pub mod validator;
