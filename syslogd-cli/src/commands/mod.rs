pub mod console;
pub mod daemon;
pub mod query;
pub mod submit;
