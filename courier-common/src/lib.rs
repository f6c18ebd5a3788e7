pub mod logging;
pub mod record;
pub mod tls;

pub use record::Record;
pub use tls::TlsConfig;
pub use tracing;
