pub mod amqp;
pub mod broker;
pub mod memory;
