pub mod compare;
pub mod show;
