pub mod files;
pub mod run;
pub mod user;
pub mod verify;
