pub mod broadcast;
pub mod pool;
pub mod registry;
pub mod tcp;
pub mod udp_session;
