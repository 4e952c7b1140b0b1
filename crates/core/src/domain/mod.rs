pub mod item;
pub mod policy;
pub mod source;
pub mod validation;
