pub mod catalog;
pub mod descriptor;
pub mod lifecycle;
pub mod log;
