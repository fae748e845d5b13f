pub mod email;
pub mod schedule;
pub mod worker;
