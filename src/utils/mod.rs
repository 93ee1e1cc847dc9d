pub(crate) mod http;
pub mod task;
