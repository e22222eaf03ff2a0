pub mod config;
pub mod error;
pub mod ids;
pub mod image;
pub mod job;
pub mod layout;
pub mod producer;
pub mod queue;
pub mod results;
pub mod shutdown;
pub mod supervisor;
pub mod worker;
