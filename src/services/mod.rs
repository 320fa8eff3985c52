pub mod agents;
pub mod llm;
pub mod normalize;
pub mod prompts;
pub mod setup;
pub mod store;
pub mod workflow;
