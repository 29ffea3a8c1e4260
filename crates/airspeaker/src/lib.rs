pub mod broadcast;
pub mod cast;
pub mod cli;
pub mod config;
pub mod encoder;
pub mod probe;
pub mod runtime;
pub mod stream_server;
pub mod streamer;
pub mod supervisor;
