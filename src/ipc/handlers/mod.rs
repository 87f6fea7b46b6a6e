pub mod attendance;
pub mod classes;
pub mod core;
pub mod exams;
pub mod marks;
pub mod setup;
pub mod students;
