#![allow(clippy::needless_question_mark, clippy::upper_case_acronyms)]

#[macro_use]
extern crate log;

pub mod config;
pub mod data;
pub mod error;
pub mod event;
pub mod module;
pub mod net;
pub mod packet;
pub mod server;
pub mod world;

pub use error::{Error, Result};
pub use server::Server;
