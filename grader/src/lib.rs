#[macro_use]
extern crate serde_derive;

pub mod agent;
pub mod error;
/// Status API served next to the worker
pub mod handler;
pub mod option;
/// Report delivery with retries and a durable spool
pub mod reporter;
pub mod worker;
