pub mod domain;
pub mod error;
pub mod protocol;
pub mod scan;
