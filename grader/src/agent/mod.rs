pub mod hostinfo;
pub mod http;
pub mod platform;
