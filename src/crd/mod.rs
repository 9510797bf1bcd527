mod identity_server;

pub use identity_server::*;
