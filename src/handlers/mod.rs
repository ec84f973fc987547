pub mod demo;
pub mod list;
pub mod run;
pub mod up;
