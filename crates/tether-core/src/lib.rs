pub mod agent;
pub mod chunks;
pub mod errors;
pub mod ids;
pub mod parts;
pub mod prompt;
pub mod provider;
