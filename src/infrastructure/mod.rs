pub mod database;
pub mod entities;
pub mod llm;
pub mod openai;
pub mod repositories;
pub mod settings;
pub mod traits;
pub mod vector_store;
