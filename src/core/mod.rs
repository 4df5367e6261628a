pub mod codec;
pub mod job;
pub mod materializer;
pub mod rpc;
pub mod settings;
pub mod train;
