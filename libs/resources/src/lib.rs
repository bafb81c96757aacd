pub mod kaniko;
pub mod student;
