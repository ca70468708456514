pub mod envelope;
pub mod tls;
