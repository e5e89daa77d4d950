pub mod artifacts;
pub mod auth;
pub mod detector;
pub mod direct_apply;
pub mod field_mapper;
pub mod invoker;
pub mod preflight;
pub mod probe;
pub mod recovery;
pub mod scanner;
pub mod signals;
pub mod submitter;
pub mod verifier;
