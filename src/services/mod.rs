pub mod archive;
pub mod coordinator;
pub mod supervisor;
pub mod upstream;
