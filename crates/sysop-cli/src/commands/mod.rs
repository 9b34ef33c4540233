pub(crate) mod chat;
pub(crate) mod config;
pub(crate) mod plan;
pub(crate) mod serve;
