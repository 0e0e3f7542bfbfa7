pub mod engine;
pub mod error;
pub mod history;
pub mod prompts;
pub mod services;
pub mod traits;
