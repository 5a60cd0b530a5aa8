pub mod credential;
pub mod job;
pub mod model_config;
pub mod request;
pub mod result;
