#![allow(dead_code)]

pub mod range_server;
pub mod raw_http;
pub mod socket_guard;
