pub mod retention;
pub mod worker;
